//! Status poller.
//!
//! One poll cycle reads the status of every outstanding job and reconciles
//! the registry. It never submits or cancels anything; deciding what to do
//! about newly failed jobs is left to the caller.

use crate::backend::{BackendAdapter, BackendSet, NormalizedState};
use crate::error::{OrchestratorError, QueryError, Result};
use crate::job::{BackendHandle, BackendKind, JobId, JobState, Observation};
use crate::registry::{JobRegistry, OutstandingJob};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Time between poll cycles
    pub interval_ms: u64,
    /// Consecutive unusable observations tolerated before `LostTrack`
    pub lost_track_grace_polls: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            lost_track_grace_polls: 5,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(OrchestratorError::config("poll interval must be positive"));
        }
        Ok(())
    }
}

/// A transition committed by a poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledTransition {
    pub id: JobId,
    pub backend: BackendKind,
    pub from: JobState,
    pub to: JobState,
}

/// What one poll cycle did
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    /// Jobs whose status was looked at
    pub polled: usize,
    pub transitions: Vec<PolledTransition>,
    /// Jobs that reached `Failed` in this cycle (candidates for the retry policy)
    pub newly_failed: Vec<JobId>,
    /// Observations without a usable status that stayed within grace
    pub unusable: usize,
    /// Backend calls that failed, one entry per backend
    pub query_errors: Vec<(BackendKind, String)>,
}

impl PollReport {
    pub fn is_quiet(&self) -> bool {
        self.transitions.is_empty() && self.query_errors.is_empty()
    }
}

type StatusResults = HashMap<BackendHandle, std::result::Result<NormalizedState, QueryError>>;

pub struct StatusPoller {
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run one poll cycle over all outstanding jobs
    pub async fn poll_once(
        &self,
        registry: &JobRegistry,
        backends: &BackendSet,
        now: DateTime<Utc>,
    ) -> PollReport {
        let outstanding = registry.outstanding();
        let mut report = PollReport::default();
        if outstanding.is_empty() {
            return report;
        }

        let queries = outstanding.iter().map(|(kind, jobs)| async move {
            let results = match backends.get(*kind) {
                Ok(adapter) => Self::query_backend(adapter, jobs).await,
                Err(e) => Err(QueryError::new(e.to_string())),
            };
            (*kind, results)
        });

        for (kind, results) in join_all(queries).await {
            let jobs = &outstanding[&kind];
            report.polled += jobs.len();
            let results = match results {
                Ok(results) => results,
                Err(e) => {
                    warn!("Status query for {} failed: {}", kind, e);
                    report.query_errors.push((kind, e.message.clone()));
                    jobs.iter()
                        .map(|job| (job.handle.clone(), Err(e.clone())))
                        .collect()
                }
            };
            for job in jobs {
                self.apply(registry, kind, job, results.get(&job.handle), now, &mut report);
            }
        }

        if !report.is_quiet() {
            info!(
                "Poll cycle: {} job(s) polled, {} transition(s), {} newly failed, {} query error(s)",
                report.polled,
                report.transitions.len(),
                report.newly_failed.len(),
                report.query_errors.len()
            );
        }
        report
    }

    /// One batched call where the backend supports it, otherwise one call per job
    async fn query_backend(
        adapter: Arc<dyn BackendAdapter>,
        jobs: &[OutstandingJob],
    ) -> std::result::Result<StatusResults, QueryError> {
        let started = Instant::now();
        let handles: Vec<BackendHandle> = jobs.iter().map(|job| job.handle.clone()).collect();

        let results: StatusResults = if adapter.supports_batch_query() {
            adapter
                .query_status_batch(&handles)
                .await?
                .into_iter()
                .map(|(handle, state)| (handle, Ok(state)))
                .collect()
        } else {
            let adapter = &adapter;
            join_all(handles.iter().map(|handle| async move {
                (handle.clone(), adapter.query_status(handle).await)
            }))
            .await
            .into_iter()
            .collect()
        };

        debug!(
            "Queried {} handle(s) on {} in {:?}",
            handles.len(),
            adapter.kind(),
            started.elapsed()
        );
        Ok(results)
    }

    fn apply(
        &self,
        registry: &JobRegistry,
        backend: BackendKind,
        outstanding: &OutstandingJob,
        result: Option<&std::result::Result<NormalizedState, QueryError>>,
        now: DateTime<Utc>,
        report: &mut PollReport,
    ) {
        let grace = self.config.lost_track_grace_polls;
        let observed = registry.transition(&outstanding.id, now, |sm| {
            // The job may have moved on while the query was in flight
            let job = sm.job();
            if !job.state.is_outstanding() || job.backend_handle.as_ref() != Some(&outstanding.handle)
            {
                return Ok(Observation::Unchanged);
            }
            match result {
                Some(Ok(state)) => sm.observe(state, grace),
                // Missing from the backend's answer
                None => sm.observe(&NormalizedState::Unknown, grace),
                Some(Err(_)) => sm.unusable(grace),
            }
        });

        match observed {
            Ok(Observation::Unchanged) => {}
            Ok(Observation::Unusable { streak }) => {
                debug!(
                    "Job {}: no usable status ({} of {} tolerated)",
                    outstanding.id, streak, grace
                );
                report.unusable += 1;
            }
            Ok(Observation::Transitioned { from, to }) => {
                info!("Job {}: {} -> {}", outstanding.id, from, to);
                if let JobState::Failed { reason } = &to {
                    warn!("Job {} failed: {}", outstanding.id, reason);
                    report.newly_failed.push(outstanding.id.clone());
                }
                report.transitions.push(PolledTransition {
                    id: outstanding.id.clone(),
                    backend,
                    from,
                    to,
                });
            }
            Err(e) => warn!("Job {}: could not apply status: {}", outstanding.id, e),
        }
    }
}
