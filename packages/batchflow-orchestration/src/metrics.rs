//! Prometheus metrics for the lifecycle engine (feature `metrics`)

use crate::error::{OrchestratorError, Result};
use crate::job::{BackendKind, FailureReason, JobState};
use crate::poller::PollReport;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts,
    Registry,
};

#[derive(Clone)]
pub struct EngineMetrics {
    /// Submission attempts by backend and outcome (`accepted` / `rejected`)
    pub submissions: IntCounterVec,
    /// Committed transitions by target state
    pub transitions: IntCounterVec,
    /// `LostTrack` failures by backend
    pub lost_track: IntCounterVec,
    /// Backend status calls that failed
    pub query_errors: IntCounterVec,
    /// Jobs in Pending/Running after the last poll cycle
    pub outstanding: IntGauge,
    pub poll_duration: Histogram,
}

fn registration(e: prometheus::Error) -> OrchestratorError {
    OrchestratorError::config(format!("metrics registration failed: {}", e))
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            submissions: register_int_counter_vec_with_registry!(
                Opts::new("batchflow_submissions_total", "Submission attempts"),
                &["backend", "outcome"],
                registry
            )
            .map_err(registration)?,
            transitions: register_int_counter_vec_with_registry!(
                Opts::new("batchflow_transitions_total", "Job state transitions"),
                &["state"],
                registry
            )
            .map_err(registration)?,
            lost_track: register_int_counter_vec_with_registry!(
                Opts::new("batchflow_lost_track_total", "Jobs failed with LostTrack"),
                &["backend"],
                registry
            )
            .map_err(registration)?,
            query_errors: register_int_counter_vec_with_registry!(
                Opts::new("batchflow_query_errors_total", "Failed backend status queries"),
                &["backend"],
                registry
            )
            .map_err(registration)?,
            outstanding: register_int_gauge_with_registry!(
                Opts::new("batchflow_outstanding_jobs", "Jobs pending or running"),
                registry
            )
            .map_err(registration)?,
            poll_duration: register_histogram_with_registry!(
                HistogramOpts::new("batchflow_poll_duration_seconds", "Poll cycle duration"),
                registry
            )
            .map_err(registration)?,
        })
    }

    pub fn record_submission(&self, backend: BackendKind, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.submissions
            .with_label_values(&[backend.as_str(), outcome])
            .inc();
    }

    pub fn record_transition(&self, to: &JobState) {
        self.transitions.with_label_values(&[to.state_name()]).inc();
    }

    pub fn record_poll(&self, report: &PollReport, seconds: f64) {
        self.poll_duration.observe(seconds);
        for (backend, _) in &report.query_errors {
            self.query_errors.with_label_values(&[backend.as_str()]).inc();
        }
        for transition in &report.transitions {
            if let JobState::Failed {
                reason: FailureReason::LostTrack { .. },
            } = &transition.to
            {
                self.lost_track
                    .with_label_values(&[transition.backend.as_str()])
                    .inc();
            }
        }
    }
}
