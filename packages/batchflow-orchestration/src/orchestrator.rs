use crate::backend::{BackendSet, SubmitRequest};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result, SubmissionError};
use crate::job::{
    BackendHandle, BackendKind, Job, JobId, JobSpec, JobState, ResourceRequest, ScheduledRetry,
    ScriptRef,
};
use crate::poller::{PollReport, StatusPoller};
use crate::registry::{JobEvent, JobRegistry};
use crate::retry::{RetryDecision, RetryPolicy};
use batchflow_storage::{SnapshotMeta, SnapshotStore};
use dashmap::DashSet;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::EngineMetrics;

/// Longest pause between scans for due resubmissions in `run`
const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest pause, so a retry that cannot start does not spin the loop
const MIN_RETRY_WAIT: Duration = Duration::from_millis(10);

/// How a cancel request was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Nothing had reached a backend yet
    CancelledLocally,
    /// The backend confirmed the cancellation
    Confirmed,
    /// A submission is in flight; the cancel is applied as soon as it returns
    Deferred,
    /// A scheduled resubmission was dropped
    RetryAborted,
    /// The job had already settled in this state
    AlreadyTerminal(JobState),
}

/// What the retry policy did with a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
enum RetryStep {
    /// Reset to `Defined`; submit right away
    Immediate,
    Scheduled,
    GaveUp,
    /// Not a failure awaiting a decision (already decided, or cancelled)
    Skipped,
}

enum CancelPlan {
    Done(CancelOutcome),
    OnBackend(BackendKind, BackendHandle),
}

/// Marks a backend cancel as in flight until dropped
struct CancelInFlight<'a> {
    set: &'a DashSet<JobId>,
    id: JobId,
}

impl Drop for CancelInFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Job lifecycle engine: definition, submission, polling, retries, cancellation
pub struct JobOrchestrator {
    registry: Arc<JobRegistry>,
    backends: BackendSet,
    retry: RetryPolicy,
    poller: StatusPoller,
    default_backend: BackendKind,
    default_resources: ResourceRequest,
    persist_interval: Option<Duration>,
    snapshot_retention: usize,
    cancels_in_flight: DashSet<JobId>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
    #[cfg(feature = "metrics")]
    metrics: Option<EngineMetrics>,
}

impl JobOrchestrator {
    /// Create an engine over `backends` with the policies in `config`
    pub fn new(config: &EngineConfig, backends: BackendSet) -> Result<Self> {
        config.validate()?;
        for kind in &config.retry.fallback_backend_order {
            if !backends.contains(*kind) {
                warn!("Fallback backend {} has no registered adapter", kind);
            }
        }

        Ok(Self {
            registry: Arc::new(JobRegistry::new()),
            backends,
            retry: config.retry.clone(),
            poller: StatusPoller::new(config.poller.clone()),
            default_backend: config.default_backend,
            default_resources: config.default_resources.clone(),
            persist_interval: config.persist_interval(),
            snapshot_retention: config.snapshot_retention,
            cancels_in_flight: DashSet::new(),
            clock: Arc::new(SystemClock),
            store: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    /// Engine with adapters for the real scheduler CLIs named in `config`
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config, config.build_backends())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    // ═══════════════════════════════════════════════════════════════════
    // Observation
    // ═══════════════════════════════════════════════════════════════════

    pub fn get(&self, id: &JobId) -> Result<Job> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<Job> {
        self.registry.list()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    /// Drop a settled job from the registry
    pub fn remove(&self, id: &JobId) -> Result<Job> {
        self.registry.remove(id)
    }

    /// Wait until the job is settled: succeeded, cancelled, or failed with no
    /// resubmission left.
    pub async fn wait_for_terminal(&self, id: &JobId, timeout: Duration) -> Result<Job> {
        let mut events = self.registry.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let job = self.registry.get(id)?;
            if job.is_settled() {
                return Ok(job);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::WaitTimeout(id.clone()));
            }
            // Retry decisions are annotations and emit no event, so re-check periodically
            let wait = (deadline - now).min(Duration::from_millis(100));
            match tokio::time::timeout(wait, events.recv()).await {
                Ok(Ok(_)) | Err(_) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("Waiter for {} skipped {} event(s)", id, skipped);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return self.registry.get(id);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Definition and submission
    // ═══════════════════════════════════════════════════════════════════

    /// Validate a job spec and register it in `Defined`.
    ///
    /// A spec without a backend goes to the configured default backend.
    /// Invalid requests fail with a configuration error and create no record.
    pub fn define(&self, mut spec: JobSpec) -> Result<JobId> {
        let backend = *spec.backend.get_or_insert(self.default_backend);
        if !self.backends.contains(backend) {
            return Err(OrchestratorError::config(format!(
                "backend {} is not available",
                backend
            )));
        }
        match &spec.script {
            ScriptRef::Inline(line) if line.trim().is_empty() => {
                return Err(OrchestratorError::config("inline script is empty"));
            }
            ScriptRef::Path(path) if path.as_os_str().is_empty() => {
                return Err(OrchestratorError::config("script path is empty"));
            }
            _ => {}
        }
        spec.resources = spec.resources.with_defaults(&self.default_resources);
        spec.resources.validate()?;

        let job = Job::from_spec(spec, self.clock.now());
        let id = job.id.clone();
        info!("Defined job {} for {}", job.label(), job.backend_kind);
        self.registry.insert(job)?;
        Ok(id)
    }

    /// Define and submit in one step
    pub async fn define_and_submit(&self, spec: JobSpec) -> Result<(JobId, JobState)> {
        let id = self.define(spec)?;
        let state = self.submit(&id).await?;
        Ok((id, state))
    }

    /// Submit a `Defined` job.
    ///
    /// Failed attempts go through the retry policy; zero-delay resubmissions
    /// happen before this returns, delayed ones are left for
    /// `run_due_retries`. Returns the job's state afterwards.
    pub async fn submit(&self, id: &JobId) -> Result<JobState> {
        loop {
            let started = self.registry.transition(id, self.clock.now(), |sm| {
                let (cancelled, cancel_requested) = (
                    matches!(sm.job().state, JobState::Cancelled),
                    sm.job().cancel_requested,
                );
                if cancelled {
                    return Ok(None);
                }
                if cancel_requested {
                    sm.cancel_unsubmitted("cancelled before submission")?;
                    return Ok(None);
                }
                sm.begin_submission()?;
                let job = sm.job();
                Ok(Some((job.backend_kind, SubmitRequest::from_job(job), job.attempt_count)))
            })?;
            let Some((kind, request, attempt)) = started else {
                info!("Job {} cancelled before submission", id);
                return Ok(JobState::Cancelled);
            };

            info!("Submitting job {} to {} (attempt {})", request.name, kind, attempt);
            let outcome = match self.backends.get(kind) {
                Ok(adapter) => adapter.submit(&request).await,
                Err(e) => Err(SubmissionError::infrastructure(e.to_string())),
            };

            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_submission(kind, outcome.is_ok());
            }

            match outcome {
                Ok(handle) => return self.submission_accepted(id, kind, handle).await,
                Err(e) => {
                    warn!("Submission of job {} to {} failed: {}", id, kind, e);
                    let cancel_requested = self.registry.transition(id, self.clock.now(), |sm| {
                        sm.submission_failed(&e)?;
                        if sm.job().cancel_requested {
                            sm.cancel_after_failure("cancelled while submitting")?;
                        }
                        Ok(sm.job().cancel_requested)
                    })?;
                    if cancel_requested {
                        return Ok(JobState::Cancelled);
                    }
                    if self.evaluate_retry(id)? != RetryStep::Immediate {
                        return Ok(self.registry.get(id)?.state);
                    }
                }
            }
        }
    }

    async fn submission_accepted(
        &self,
        id: &JobId,
        kind: BackendKind,
        handle: BackendHandle,
    ) -> Result<JobState> {
        let cancel_requested = self.registry.transition(id, self.clock.now(), |sm| {
            sm.submission_succeeded(handle.clone())?;
            Ok(sm.job().cancel_requested)
        })?;
        info!("Job {} accepted by {} as {}", id, kind, handle);

        if cancel_requested {
            info!("Applying deferred cancel to job {}", id);
            if let Err(e) = self.cancel_on_backend(id, kind, &handle).await {
                // The request stays on the job; poll cycles re-issue it
                warn!("Deferred cancel of job {} failed: {}", id, e);
                return Err(e);
            }
        }
        Ok(self.registry.get(id)?.state)
    }

    /// Manually resubmit a failed or cancelled job on its current backend.
    ///
    /// Not bound by `max_attempts`; the attempt counters keep counting.
    pub async fn resubmit(&self, id: &JobId) -> Result<JobState> {
        self.registry.transition(id, self.clock.now(), |sm| {
            let job = sm.job();
            if !matches!(
                job.state,
                JobState::Failed { .. } | JobState::SubmissionFailed { .. } | JobState::Cancelled
            ) {
                return Err(OrchestratorError::invalid_transition(
                    job.state.state_name(),
                    "defined",
                ));
            }
            let backend = job.backend_kind;
            sm.reset_for_attempt(backend, false, "manual resubmission")
        })?;
        info!("Manual resubmission of job {}", id);
        self.submit(id).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Retry policy
    // ═══════════════════════════════════════════════════════════════════

    /// Ask the retry policy about a failed job and record its decision
    fn evaluate_retry(&self, id: &JobId) -> Result<RetryStep> {
        let now = self.clock.now();
        let step = self.registry.transition(id, now, |sm| {
            let job = sm.job();
            if !job.state.is_retryable_failure() || job.scheduled_retry.is_some() || job.retry_exhausted
            {
                return Ok(RetryStep::Skipped);
            }
            if job.cancel_requested {
                sm.cancel_after_failure("cancel requested, not retrying")?;
                return Ok(RetryStep::Skipped);
            }

            let decision = self.retry.decide(job);
            let note = decision.note();
            match decision {
                RetryDecision::Resubmit {
                    backend,
                    delay,
                    fresh_counter,
                } if delay.is_zero() => {
                    sm.annotate(note);
                    sm.reset_for_attempt(backend, fresh_counter, format!("resubmit on {}", backend))?;
                    Ok(RetryStep::Immediate)
                }
                RetryDecision::Resubmit {
                    backend,
                    delay,
                    fresh_counter,
                } => {
                    let delay = chrono::Duration::from_std(delay)
                        .map_err(|e| OrchestratorError::config(format!("retry delay: {}", e)))?;
                    let retry = ScheduledRetry {
                        due_at: now + delay,
                        backend,
                        fresh_counter,
                    };
                    sm.schedule_retry(retry, note);
                    Ok(RetryStep::Scheduled)
                }
                RetryDecision::GiveUp { .. } => {
                    sm.give_up(note);
                    Ok(RetryStep::GaveUp)
                }
            }
        })?;

        match step {
            RetryStep::Immediate => info!("Job {}: resubmitting now", id),
            RetryStep::Scheduled => info!("Job {}: resubmission scheduled", id),
            RetryStep::GaveUp => warn!("Job {}: retry policy gave up", id),
            RetryStep::Skipped => {}
        }
        Ok(step)
    }

    /// Submit every job whose scheduled resubmission is due. Returns how many were started.
    pub async fn run_due_retries(&self) -> usize {
        let now = self.clock.now();
        let due = self.registry.due_retries(now);
        if due.is_empty() {
            return 0;
        }

        let mut ready = Vec::with_capacity(due.len());
        for id in due {
            let reset = self.registry.transition(&id, now, |sm| {
                match sm.job().scheduled_retry.clone() {
                    Some(retry) if retry.due_at <= now => {
                        let note = format!("scheduled resubmission on {}", retry.backend);
                        sm.reset_for_attempt(retry.backend, retry.fresh_counter, note)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            });
            match reset {
                Ok(true) => ready.push(id),
                Ok(false) => {}
                Err(e) => warn!("Job {}: could not start scheduled resubmission: {}", id, e),
            }
        }

        let count = ready.len();
        self.submit_each(ready).await;
        count
    }

    async fn submit_each(&self, ids: Vec<JobId>) {
        let results = join_all(ids.iter().map(|id| self.submit(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                error!("Job {}: resubmission failed: {}", id, e);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Polling
    // ═══════════════════════════════════════════════════════════════════

    /// One poll cycle, then the retry policy for every job it saw fail and
    /// another attempt at every cancel the backend has not confirmed yet
    pub async fn poll_cycle(&self) -> PollReport {
        let started = Instant::now();
        let report = self
            .poller
            .poll_once(&self.registry, &self.backends, self.clock.now())
            .await;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_poll(&report, started.elapsed().as_secs_f64());
            for transition in &report.transitions {
                metrics.record_transition(&transition.to);
            }
            metrics.outstanding.set(self.registry.outstanding_count() as i64);
        }

        let mut immediate = Vec::new();
        for id in &report.newly_failed {
            match self.evaluate_retry(id) {
                Ok(RetryStep::Immediate) => immediate.push(id.clone()),
                Ok(_) => {}
                Err(e) => error!("Job {}: retry evaluation failed: {}", id, e),
            }
        }
        self.submit_each(immediate).await;
        self.retry_pending_cancels().await;

        debug!("Poll cycle finished in {:?}", started.elapsed());
        report
    }

    async fn retry_pending_cancels(&self) {
        let pending: Vec<_> = self
            .registry
            .pending_cancels()
            .into_iter()
            .filter(|(id, _, _)| !self.cancels_in_flight.contains(id))
            .collect();
        if pending.is_empty() {
            return;
        }

        let results = join_all(
            pending
                .iter()
                .map(|(id, kind, handle)| self.cancel_on_backend(id, *kind, handle)),
        )
        .await;
        for ((id, kind, _), result) in pending.iter().zip(results) {
            match result {
                Ok(outcome) => info!("Pending cancel of job {} on {}: {:?}", id, kind, outcome),
                Err(e) => warn!("Pending cancel of job {} on {} failed again: {}", id, kind, e),
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cancellation
    // ═══════════════════════════════════════════════════════════════════

    /// Cancel a job wherever it is in its lifecycle.
    ///
    /// A `CancelError` leaves the job's state unchanged; the next poll
    /// reconciles it with what the backend actually did.
    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let plan = self.registry.transition(id, self.clock.now(), |sm| {
            let job = sm.job();
            let state = job.state.clone();
            let target = job.backend_handle.clone().map(|h| (job.backend_kind, h));
            let retry_scheduled = job.scheduled_retry.is_some();

            match state {
                JobState::Defined => {
                    sm.cancel_unsubmitted("cancelled before submission")?;
                    Ok(CancelPlan::Done(CancelOutcome::CancelledLocally))
                }
                JobState::Submitting => {
                    sm.request_cancel();
                    Ok(CancelPlan::Done(CancelOutcome::Deferred))
                }
                JobState::Pending | JobState::Running => {
                    let (kind, handle) = target.ok_or_else(|| {
                        OrchestratorError::invalid_transition(state.state_name(), "cancelled")
                    })?;
                    sm.request_cancel();
                    Ok(CancelPlan::OnBackend(kind, handle))
                }
                JobState::Failed { .. } | JobState::SubmissionFailed { .. } if retry_scheduled => {
                    sm.abort_scheduled_retry()?;
                    Ok(CancelPlan::Done(CancelOutcome::RetryAborted))
                }
                settled => Ok(CancelPlan::Done(CancelOutcome::AlreadyTerminal(settled))),
            }
        })?;

        match plan {
            CancelPlan::Done(outcome) => {
                info!("Cancel of job {}: {:?}", id, outcome);
                Ok(outcome)
            }
            CancelPlan::OnBackend(kind, handle) => self.cancel_on_backend(id, kind, &handle).await,
        }
    }

    async fn cancel_on_backend(
        &self,
        id: &JobId,
        kind: BackendKind,
        handle: &BackendHandle,
    ) -> Result<CancelOutcome> {
        let adapter = self.backends.get(kind)?;
        self.cancels_in_flight.insert(id.clone());
        let in_flight = CancelInFlight {
            set: &self.cancels_in_flight,
            id: id.clone(),
        };
        let cancelled = adapter.cancel(handle).await;
        drop(in_flight);
        cancelled?;

        self.registry.transition(id, self.clock.now(), |sm| {
            let job = sm.job();
            if job.state.is_outstanding() && job.backend_handle.as_ref() == Some(handle) {
                sm.cancel_confirmed()?;
                info!("Job {} cancelled on {}", id, kind);
                Ok(CancelOutcome::Confirmed)
            } else {
                // Finished on its own before the cancel landed
                Ok(CancelOutcome::AlreadyTerminal(job.state.clone()))
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════

    fn store(&self) -> Result<&Arc<dyn SnapshotStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| OrchestratorError::config("no snapshot store attached"))
    }

    /// Snapshot the registry to the attached store, then drop all but the
    /// newest `snapshot_retention` snapshots
    pub async fn persist(&self) -> Result<SnapshotMeta> {
        let store = self.store()?;
        let meta = self.registry.persist(store.as_ref(), self.clock.now()).await?;
        let pruned = store.prune(self.snapshot_retention).await?;
        if pruned > 0 {
            debug!("Pruned {} old snapshot(s)", pruned);
        }
        Ok(meta)
    }

    /// Load the latest snapshot and recover jobs a restart left undecided.
    ///
    /// Jobs caught in `Submitting` cannot know whether the backend accepted
    /// them; they become `SubmissionFailed` and go through the retry policy.
    pub async fn reload(&self) -> Result<usize> {
        let store = Arc::clone(self.store()?);
        let loaded = self.registry.reload(store.as_ref()).await?;

        for id in self.registry.submitting() {
            warn!("Job {} was interrupted during submission", id);
            self.registry
                .transition(&id, self.clock.now(), |sm| sm.mark_interrupted())?;
        }

        let mut immediate = Vec::new();
        for id in self.registry.undecided_failures() {
            if self.evaluate_retry(&id)? == RetryStep::Immediate {
                immediate.push(id);
            }
        }
        self.submit_each(immediate).await;
        Ok(loaded)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Background loop
    // ═══════════════════════════════════════════════════════════════════

    /// How long `run` sleeps before looking for due resubmissions: until the
    /// earliest one is due, but never longer than the scan interval
    pub fn next_retry_wait(&self) -> Duration {
        let cap = self.poller.config().interval().min(RETRY_SCAN_INTERVAL);
        match self.registry.next_retry_at() {
            Some(due) => (due - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_RETRY_WAIT, cap.max(MIN_RETRY_WAIT)),
            None => cap,
        }
    }

    /// Poll, run due retries and take periodic snapshots until `shutdown` fires.
    ///
    /// A final snapshot is written on shutdown when a store is attached.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let poll_every = self.poller.config().interval();
        let mut poll = tokio::time::interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let persist_every = self.persist_interval.filter(|_| self.store.is_some());
        let first_snapshot = persist_every.unwrap_or(poll_every);
        let mut snapshots =
            tokio::time::interval_at(tokio::time::Instant::now() + first_snapshot, first_snapshot);
        snapshots.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Engine running: poll every {:?}, backends {:?}",
            poll_every,
            self.backends.kinds()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    self.poll_cycle().await;
                }
                _ = tokio::time::sleep(self.next_retry_wait()) => {
                    self.run_due_retries().await;
                }
                _ = snapshots.tick(), if persist_every.is_some() => {
                    if let Err(e) = self.persist().await {
                        error!("Periodic snapshot failed: {}", e);
                    }
                }
            }
        }

        info!("Engine shutting down");
        if self.store.is_some() {
            self.persist().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAdapter, NormalizedState};
    use crate::clock::ManualClock;
    use crate::error::{CancelError, QueryError};
    use crate::retry::Backoff;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Scripted cluster: queued submit results, settable statuses
    #[derive(Default)]
    struct FakeCluster {
        submits: Mutex<VecDeque<std::result::Result<String, SubmissionError>>>,
        states: Mutex<HashMap<BackendHandle, NormalizedState>>,
        cancel_fails: Mutex<bool>,
        submitted: Mutex<usize>,
    }

    impl FakeCluster {
        fn accept(&self, handle: &str) {
            self.submits.lock().push_back(Ok(handle.to_string()));
        }

        fn reject(&self, error: SubmissionError) {
            self.submits.lock().push_back(Err(error));
        }

        fn set(&self, handle: &str, state: NormalizedState) {
            self.states.lock().insert(BackendHandle::new(handle), state);
        }
    }

    #[async_trait]
    impl BackendAdapter for FakeCluster {
        fn kind(&self) -> BackendKind {
            BackendKind::Slurm
        }

        async fn submit(
            &self,
            _: &SubmitRequest,
        ) -> std::result::Result<BackendHandle, SubmissionError> {
            *self.submitted.lock() += 1;
            let next = self
                .submits
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SubmissionError::transient("no scripted result")));
            let handle = BackendHandle::new(next?);
            self.set(handle.as_str(), NormalizedState::Pending);
            Ok(handle)
        }

        async fn query_status(
            &self,
            handle: &BackendHandle,
        ) -> std::result::Result<NormalizedState, QueryError> {
            Ok(self
                .states
                .lock()
                .get(handle)
                .cloned()
                .unwrap_or(NormalizedState::Unknown))
        }

        async fn cancel(&self, handle: &BackendHandle) -> std::result::Result<(), CancelError> {
            if *self.cancel_fails.lock() {
                return Err(CancelError::unverifiable("still running"));
            }
            self.set(handle.as_str(), NormalizedState::Cancelled);
            Ok(())
        }
    }

    fn engine(retry: RetryPolicy) -> (JobOrchestrator, Arc<FakeCluster>, Arc<ManualClock>) {
        let cluster = Arc::new(FakeCluster::default());
        let clock = Arc::new(ManualClock::default());
        let config = EngineConfig {
            default_backend: BackendKind::Slurm,
            enabled_backends: vec![BackendKind::Slurm],
            retry,
            ..Default::default()
        };
        let orchestrator = JobOrchestrator::new(&config, BackendSet::new().with(cluster.clone()))
            .unwrap()
            .with_clock(clock.clone());
        (orchestrator, cluster, clock)
    }

    fn spec(id: &str) -> JobSpec {
        JobSpec::inline("run.sh", BackendKind::Slurm).with_id(id)
    }

    #[test]
    fn test_define_rejects_bad_requests() {
        let (engine, _, _) = engine(RetryPolicy::default());

        let bad_resources = spec("a").with_resources(ResourceRequest {
            memory: Some("plenty".into()),
            ..Default::default()
        });
        assert!(matches!(
            engine.define(bad_resources),
            Err(OrchestratorError::Config(_))
        ));
        assert!(matches!(
            engine.define(JobSpec::inline("true", BackendKind::HTCondor)),
            Err(OrchestratorError::Config(_))
        ));
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn test_failed_submission_then_success() {
        let (engine, cluster, _) = engine(RetryPolicy::new(2, Backoff::none()));
        cluster.reject(SubmissionError::transient("sbatch: socket timed out"));
        cluster.accept("101");

        let (id, state) = engine.define_and_submit(spec("j2")).await.unwrap();

        assert_eq!(state, JobState::Pending);
        let job = engine.get(&id).unwrap();
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.backend_handle, Some(BackendHandle::new("101")));
        assert_eq!(
            crate::job::JobStateMachine::replay(&job.history).unwrap(),
            job.state
        );
    }

    #[tokio::test]
    async fn test_delayed_retry_waits_for_clock() {
        let (engine, cluster, clock) = engine(RetryPolicy::new(
            3,
            Backoff::Fixed { delay_ms: 30_000 },
        ));
        cluster.reject(SubmissionError::transient("busy"));
        cluster.accept("7");

        let (id, state) = engine.define_and_submit(spec("d")).await.unwrap();
        assert!(matches!(state, JobState::SubmissionFailed { .. }));
        assert_eq!(engine.run_due_retries().await, 0);

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(engine.run_due_retries().await, 1);
        assert_eq!(engine.get(&id).unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_poll_failure_triggers_resubmission() {
        let (engine, cluster, _) = engine(RetryPolicy::new(2, Backoff::none()));
        cluster.accept("1");
        cluster.accept("2");
        let (id, _) = engine.define_and_submit(spec("p")).await.unwrap();

        cluster.set("1", NormalizedState::Failed { detail: Some("1:0".into()) });
        let report = engine.poll_cycle().await;

        assert_eq!(report.newly_failed, vec![id.clone()]);
        let job = engine.get(&id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.backend_handle, Some(BackendHandle::new("2")));
        assert_eq!(job.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let (engine, cluster, _) = engine(RetryPolicy::default());
        cluster.accept("5");
        let (id, _) = engine.define_and_submit(spec("c")).await.unwrap();

        assert_eq!(engine.cancel(&id).await.unwrap(), CancelOutcome::Confirmed);
        let job = engine.get(&id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.backend_handle.is_some());
    }

    #[tokio::test]
    async fn test_unverifiable_cancel_leaves_state() {
        let (engine, cluster, _) = engine(RetryPolicy::default());
        cluster.accept("6");
        *cluster.cancel_fails.lock() = true;
        let (id, _) = engine.define_and_submit(spec("u")).await.unwrap();

        assert!(matches!(
            engine.cancel(&id).await,
            Err(OrchestratorError::Cancel(_))
        ));
        assert_eq!(engine.get(&id).unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_cancel_defined_and_settled_jobs() {
        let (engine, cluster, _) = engine(RetryPolicy::default());
        let id = engine.define(spec("x")).unwrap();
        assert_eq!(
            engine.cancel(&id).await.unwrap(),
            CancelOutcome::CancelledLocally
        );
        assert_eq!(
            engine.cancel(&id).await.unwrap(),
            CancelOutcome::AlreadyTerminal(JobState::Cancelled)
        );
        assert_eq!(engine.submit(&id).await.unwrap(), JobState::Cancelled);
        assert_eq!(*cluster.submitted.lock(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_scheduled_retry() {
        let (engine, cluster, _) = engine(RetryPolicy::new(3, Backoff::Fixed { delay_ms: 60_000 }));
        cluster.reject(SubmissionError::transient("busy"));
        let (id, _) = engine.define_and_submit(spec("s")).await.unwrap();
        assert!(engine.get(&id).unwrap().scheduled_retry.is_some());

        assert_eq!(engine.cancel(&id).await.unwrap(), CancelOutcome::RetryAborted);
        let job = engine.get(&id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.scheduled_retry.is_none());
    }

    #[tokio::test]
    async fn test_manual_resubmit_ignores_max_attempts() {
        let (engine, cluster, _) = engine(RetryPolicy::new(1, Backoff::none()));
        cluster.reject(SubmissionError::transient("down"));
        cluster.accept("9");

        let (id, state) = engine.define_and_submit(spec("m")).await.unwrap();
        assert!(matches!(state, JobState::SubmissionFailed { .. }));
        assert!(engine.get(&id).unwrap().retry_exhausted);

        assert_eq!(engine.resubmit(&id).await.unwrap(), JobState::Pending);
        assert_eq!(engine.get(&id).unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let (engine, cluster, _) = engine(RetryPolicy::default());
        cluster.accept("3");
        let (id, _) = engine.define_and_submit(spec("w")).await.unwrap();

        assert!(matches!(
            engine.wait_for_terminal(&id, Duration::from_millis(50)).await,
            Err(OrchestratorError::WaitTimeout(_))
        ));

        cluster.set("3", NormalizedState::Succeeded);
        engine.poll_cycle().await;
        let job = engine
            .wait_for_terminal(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_persist_requires_store() {
        let (engine, _, _) = engine(RetryPolicy::default());
        assert!(matches!(
            engine.persist().await,
            Err(OrchestratorError::Config(_))
        ));
    }

    #[test]
    fn test_spec_without_backend_uses_default_backend() {
        let (engine, _, _) = engine(RetryPolicy::default());
        let id = engine
            .define(JobSpec::from_script(ScriptRef::Inline("true".into())).with_id("d"))
            .unwrap();
        assert_eq!(engine.get(&id).unwrap().backend_kind, BackendKind::Slurm);
    }

    #[tokio::test]
    async fn test_failed_cancel_is_retried_on_next_poll() {
        let (engine, cluster, _) = engine(RetryPolicy::default());
        cluster.accept("8");
        *cluster.cancel_fails.lock() = true;
        let (id, _) = engine.define_and_submit(spec("r")).await.unwrap();
        assert!(engine.cancel(&id).await.is_err());

        // Still refused: nothing changes
        engine.poll_cycle().await;
        let job = engine.get(&id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.cancel_requested);

        *cluster.cancel_fails.lock() = false;
        engine.poll_cycle().await;
        assert_eq!(engine.get(&id).unwrap().state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_next_retry_wait_follows_earliest_due_retry() {
        let (engine, cluster, clock) =
            engine(RetryPolicy::new(3, Backoff::Fixed { delay_ms: 400 }));
        assert_eq!(engine.next_retry_wait(), RETRY_SCAN_INTERVAL);

        cluster.reject(SubmissionError::transient("busy"));
        engine.define_and_submit(spec("n")).await.unwrap();
        assert_eq!(engine.next_retry_wait(), Duration::from_millis(400));

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(engine.next_retry_wait(), MIN_RETRY_WAIT);
    }
}
