//! End-to-end job lifecycle scenarios
//!
//! Drives the engine through submission, polling, retries, fallback and
//! cancellation against scripted backends (and one real local process).

mod common;

use batchflow_orchestration::{
    Backoff, BackendKind, BackendSet, CancelError, CancelOutcome, EngineConfig, ErrorCategory,
    FailureReason, JobOrchestrator, JobSpec, JobState, LocalBackend, NormalizedState,
    OrchestratorError, PollerConfig, RetryPolicy, SubmissionError,
};
use common::{engine, ScriptedBackend};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_local_job_runs_to_success_without_resubmission() {
    let config = EngineConfig {
        poller: PollerConfig {
            interval_ms: 20,
            lost_track_grace_polls: 5,
        },
        ..Default::default()
    };
    let backends = BackendSet::new().with(Arc::new(LocalBackend::new()));
    let engine = JobOrchestrator::new(&config, backends).expect("engine");

    let (id, state) = engine
        .define_and_submit(JobSpec::inline("exit 0", BackendKind::Local).with_name("quick"))
        .await
        .expect("submit");
    assert_eq!(state, JobState::Pending);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        engine.poll_cycle().await;
        if engine.get(&id).expect("job").state.is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "local job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let job = engine.get(&id).expect("job");
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.total_attempts, 1);
    assert!(job.is_settled());
}

#[tokio::test]
async fn test_transient_failure_then_accepted() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    slurm.fail_next(SubmissionError::transient("sbatch: Socket timed out"));
    let (engine, _clock) = engine(RetryPolicy::new(2, Backoff::none()), 5, &[slurm.clone()]);

    let (id, state) = engine
        .define_and_submit(JobSpec::inline("echo hi", BackendKind::Slurm))
        .await
        .expect("submit");

    assert_eq!(state, JobState::Pending);
    let job = engine.get(&id).expect("job");
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.total_attempts, 2);
    assert_eq!(slurm.submits(), 2);
    assert!(job.backend_handle.is_some());
    assert!(job.history.iter().any(|entry| matches!(
        entry.state,
        JobState::SubmissionFailed {
            category: ErrorCategory::Transient,
            ..
        }
    )));
}

#[tokio::test]
async fn test_submission_retries_stop_at_max_attempts() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    slurm.fail_always(SubmissionError::transient("controller unreachable"));
    let (engine, _clock) = engine(RetryPolicy::new(3, Backoff::none()), 5, &[slurm.clone()]);

    let (id, state) = engine
        .define_and_submit(JobSpec::inline("echo hi", BackendKind::Slurm))
        .await
        .expect("submit");

    assert!(matches!(state, JobState::SubmissionFailed { .. }));
    assert_eq!(slurm.submits(), 3);
    let job = engine.get(&id).expect("job");
    assert_eq!(job.attempt_count, 3);
    assert!(job.retry_exhausted);
    assert!(job.is_settled());
    assert!(job.backend_handle.is_none());
}

#[tokio::test]
async fn test_unknown_status_becomes_lost_track_after_grace() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    let (engine, _clock) = engine(RetryPolicy::new(1, Backoff::none()), 5, &[slurm.clone()]);

    let (id, _) = engine
        .define_and_submit(JobSpec::inline("sleep 100", BackendKind::Slurm))
        .await
        .expect("submit");
    let handle = engine.get(&id).expect("job").backend_handle.expect("handle");
    slurm.forget(&handle);

    for polls in 1..=5 {
        engine.poll_cycle().await;
        let job = engine.get(&id).expect("job");
        assert_eq!(job.state, JobState::Pending, "poll {}", polls);
        assert_eq!(job.unknown_streak, polls);
    }

    let report = engine.poll_cycle().await;
    assert_eq!(report.newly_failed, vec![id.clone()]);

    let job = engine.get(&id).expect("job");
    assert_eq!(
        job.state,
        JobState::Failed {
            reason: FailureReason::LostTrack { observations: 6 }
        }
    );
    // One attempt allowed and no fallback: the policy gives up
    assert!(job.retry_exhausted);
    assert_eq!(slurm.submits(), 1);
}

#[tokio::test]
async fn test_polling_a_finished_job_changes_nothing() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    let (engine, _clock) = engine(RetryPolicy::default(), 5, &[slurm.clone()]);

    let (id, _) = engine
        .define_and_submit(JobSpec::inline("true", BackendKind::Slurm))
        .await
        .expect("submit");
    let handle = engine.get(&id).expect("job").backend_handle.expect("handle");

    slurm.set_status(&handle, NormalizedState::Running);
    engine.poll_cycle().await;
    slurm.set_status(&handle, NormalizedState::Succeeded);
    engine.poll_cycle().await;

    let settled = engine.get(&id).expect("job");
    assert_eq!(settled.state, JobState::Succeeded);
    let queries = slurm.query_calls.load(Ordering::SeqCst);

    for _ in 0..3 {
        let report = engine.poll_cycle().await;
        assert_eq!(report.polled, 0);
    }

    assert_eq!(engine.get(&id).expect("job"), settled);
    assert_eq!(slurm.query_calls.load(Ordering::SeqCst), queries);
}

#[tokio::test]
async fn test_jobs_on_two_backends_progress_independently() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    let condor = ScriptedBackend::unbatched(BackendKind::HTCondor);
    let (engine, _clock) = engine(
        RetryPolicy::new(1, Backoff::none()),
        5,
        &[slurm.clone(), condor.clone()],
    );

    let a = engine
        .define(JobSpec::inline("echo a", BackendKind::Slurm).with_name("a"))
        .expect("define a");
    let b = engine
        .define(JobSpec::inline("echo b", BackendKind::HTCondor).with_name("b"))
        .expect("define b");

    let (state_a, state_b) = tokio::join!(engine.submit(&a), engine.submit(&b));
    assert_eq!(state_a.expect("a"), JobState::Pending);
    assert_eq!(state_b.expect("b"), JobState::Pending);

    let handle_a = engine.get(&a).expect("a").backend_handle.expect("handle a");
    let handle_b = engine.get(&b).expect("b").backend_handle.expect("handle b");
    slurm.set_status(&handle_a, NormalizedState::Succeeded);
    condor.set_status(
        &handle_b,
        NormalizedState::Failed {
            detail: Some("exit code 2".to_string()),
        },
    );

    let report = engine.poll_cycle().await;
    assert_eq!(report.polled, 2);
    assert_eq!(report.newly_failed, vec![b.clone()]);

    let job_a = engine.get(&a).expect("a");
    let job_b = engine.get(&b).expect("b");
    assert_eq!(job_a.state, JobState::Succeeded);
    assert!(matches!(job_b.state, JobState::Failed { .. }));
    assert!(job_a.history.iter().all(|e| e.backend == BackendKind::Slurm));
    assert!(job_b.history.iter().all(|e| e.backend == BackendKind::HTCondor));
    assert_eq!(slurm.query_calls.load(Ordering::SeqCst), 1);
    assert_eq!(condor.query_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_while_submitting_is_applied_after_acceptance() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    let (engine, _clock) = engine(RetryPolicy::default(), 5, &[slurm.clone()]);
    let id = engine
        .define(JobSpec::inline("sleep 60", BackendKind::Slurm))
        .expect("define");

    let (entered, release) = slurm.hold_submissions();
    let (submitted, cancelled) = tokio::join!(engine.submit(&id), async {
        entered.notified().await;
        assert_eq!(engine.get(&id).expect("job").state, JobState::Submitting);
        let outcome = engine.cancel(&id).await;
        release.notify_one();
        outcome
    });

    assert_eq!(cancelled.expect("cancel"), CancelOutcome::Deferred);
    assert_eq!(submitted.expect("submit"), JobState::Cancelled);
    assert_eq!(slurm.cancel_calls.load(Ordering::SeqCst), 1);

    let job = engine.get(&id).expect("job");
    assert!(job.cancel_requested);
    assert!(job.backend_handle.is_some());
    let states: Vec<&str> = job
        .history
        .iter()
        .map(|e| e.state.state_name())
        .collect();
    assert!(states.ends_with(&["pending", "cancelled"]));
}

#[tokio::test]
async fn test_cancel_while_submitting_then_rejected_ends_cancelled() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    slurm.fail_next(SubmissionError::transient("sbatch: Socket timed out"));
    let (engine, _clock) = engine(RetryPolicy::new(3, Backoff::none()), 5, &[slurm.clone()]);
    let id = engine
        .define(JobSpec::inline("sleep 60", BackendKind::Slurm))
        .expect("define");

    let (entered, release) = slurm.hold_submissions();
    let (submitted, cancelled) = tokio::join!(engine.submit(&id), async {
        entered.notified().await;
        let outcome = engine.cancel(&id).await;
        release.notify_one();
        outcome
    });

    assert_eq!(cancelled.expect("cancel"), CancelOutcome::Deferred);
    assert_eq!(submitted.expect("submit"), JobState::Cancelled);
    // Retries were allowed, but a cancelled job is not resubmitted
    assert_eq!(slurm.submits(), 1);
    assert_eq!(slurm.cancel_calls.load(Ordering::SeqCst), 0);

    let job = engine.get(&id).expect("job");
    assert!(job.backend_handle.is_none());
    assert!(job.scheduled_retry.is_none());
    let states: Vec<&str> = job
        .history
        .iter()
        .map(|e| e.state.state_name())
        .collect();
    assert!(states.ends_with(&["submitting", "submission_failed", "cancelled"]));
}

#[tokio::test]
async fn test_failed_deferred_cancel_is_reported_and_retried() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    slurm.fail_next_cancel(CancelError::rejected("scancel: slurm controller busy"));
    let (engine, _clock) = engine(RetryPolicy::default(), 5, &[slurm.clone()]);
    let id = engine
        .define(JobSpec::inline("sleep 60", BackendKind::Slurm))
        .expect("define");

    let (entered, release) = slurm.hold_submissions();
    let (submitted, cancelled) = tokio::join!(engine.submit(&id), async {
        entered.notified().await;
        let outcome = engine.cancel(&id).await;
        release.notify_one();
        outcome
    });

    assert_eq!(cancelled.expect("cancel"), CancelOutcome::Deferred);
    assert!(matches!(submitted, Err(OrchestratorError::Cancel(_))));
    let job = engine.get(&id).expect("job");
    assert_eq!(job.state, JobState::Pending);
    assert!(job.cancel_requested);

    // The next poll cycle re-issues the cancel
    engine.poll_cycle().await;
    assert_eq!(slurm.cancel_calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.get(&id).expect("job").state, JobState::Cancelled);

    engine.poll_cycle().await;
    assert_eq!(slurm.cancel_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_permanent_failure_falls_back_to_next_backend() {
    let slurm = ScriptedBackend::new(BackendKind::Slurm);
    slurm.fail_always(SubmissionError::permanent("sbatch: error: invalid partition"));
    let condor = ScriptedBackend::new(BackendKind::HTCondor);
    let (engine, _clock) = engine(
        RetryPolicy::new(3, Backoff::none()).with_fallback([BackendKind::HTCondor]),
        5,
        &[slurm.clone(), condor.clone()],
    );

    let (id, state) = engine
        .define_and_submit(JobSpec::inline("echo hi", BackendKind::Slurm).with_id("fallback-1"))
        .await
        .expect("submit");

    assert_eq!(state, JobState::Pending);
    let job = engine.get(&id).expect("job");
    assert_eq!(job.id.as_str(), "fallback-1");
    assert_eq!(job.backend_kind, BackendKind::HTCondor);
    assert_eq!(job.backends_tried, vec![BackendKind::Slurm, BackendKind::HTCondor]);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.total_attempts, 2);
    // Permanent errors are not retried on the same backend
    assert_eq!(slurm.submits(), 1);
    assert_eq!(condor.submits(), 1);
    assert_eq!(engine.list().len(), 1);
}
