//! Job registry: the single owner of all job records.
//!
//! Each record sits behind its own lock, so transitions on different job ids
//! never contend. Every mutation goes through `update`, which applies a
//! closure to a working copy and commits it only if the closure succeeds and
//! the record still satisfies its invariants (compare-and-set per id).
//! Committed state changes are broadcast as `JobEvent`s.

use crate::error::{OrchestratorError, Result};
use crate::job::{BackendHandle, BackendKind, Job, JobId, JobState, JobStateMachine};
use batchflow_storage::{SnapshotMeta, SnapshotRecord, SnapshotStore};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Version of the `RegistrySnapshot` document
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const EVENT_CAPACITY: usize = 1024;

/// A committed state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub id: JobId,
    pub backend: BackendKind,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    /// Attempt number across all backends
    pub attempt: u32,
}

/// Persisted form of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    /// Ordered by creation time, then id
    pub jobs: Vec<Job>,
}

/// An outstanding job as seen by the poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingJob {
    pub id: JobId,
    pub handle: BackendHandle,
}

pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<Mutex<Job>>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: DashMap::new(),
            events,
        }
    }

    /// Add a new record. Ids are unique for the lifetime of the registry.
    pub fn insert(&self, job: Job) -> Result<()> {
        job.check_invariants()?;
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::DuplicateJob(job.id)),
            Entry::Vacant(slot) => {
                debug!("Registered job {} on {}", job.label(), job.backend_kind);
                slot.insert(Arc::new(Mutex::new(job)));
                Ok(())
            }
        }
    }

    fn record(&self, id: &JobId) -> Result<Arc<Mutex<Job>>> {
        // Clone the Arc so the shard guard is released before locking the job
        self.jobs
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::JobNotFound(id.clone()))
    }

    /// Snapshot of one record
    pub fn get(&self, id: &JobId) -> Result<Job> {
        Ok(self.record(id)?.lock().clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Atomically apply `f` to a job record.
    ///
    /// `f` works on a copy; if it fails, or leaves the record violating its
    /// invariants, nothing is committed. No I/O may happen inside `f`.
    pub fn update<T, F>(&self, id: &JobId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Job) -> Result<T>,
    {
        let record = self.record(id)?;
        let mut job = record.lock();

        let mut working = job.clone();
        let value = f(&mut working)?;
        working.check_invariants()?;

        let events = Self::new_events(&job, &working);
        *job = working;
        drop(job);

        for event in events {
            debug!(
                "Job {} {} -> {} (attempt {})",
                event.id, event.from, event.to, event.attempt
            );
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        Ok(value)
    }

    /// Apply a state machine operation at `now`
    pub fn transition<T, F>(&self, id: &JobId, now: DateTime<Utc>, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobStateMachine<'_>) -> Result<T>,
    {
        self.update(id, |job| f(&mut JobStateMachine::new(job, now)))
    }

    fn new_events(before: &Job, after: &Job) -> Vec<JobEvent> {
        let mut previous = before.state.clone();
        let mut events = Vec::new();
        for entry in after.history.iter().skip(before.history.len()) {
            if entry.state != previous {
                events.push(JobEvent {
                    id: after.id.clone(),
                    backend: entry.backend,
                    from: std::mem::replace(&mut previous, entry.state.clone()),
                    to: entry.state.clone(),
                    at: entry.at,
                    attempt: entry.attempt,
                });
            }
        }
        events
    }

    /// Remove a record. Only terminal jobs with no scheduled resubmission can leave.
    pub fn remove(&self, id: &JobId) -> Result<Job> {
        let removable = |_: &JobId, record: &Arc<Mutex<Job>>| {
            let job = record.lock();
            job.state.is_terminal() && job.scheduled_retry.is_none()
        };
        match self.jobs.remove_if(id, removable) {
            Some((_, record)) => {
                let job = record.lock().clone();
                info!("Removed job {} ({})", job.label(), job.state);
                Ok(job)
            }
            None => {
                let job = self.get(id)?;
                Err(OrchestratorError::invalid_transition(
                    job.state.state_name(),
                    "removed",
                ))
            }
        }
    }

    /// All records, ordered by creation time then id
    pub fn list(&self) -> Vec<Job> {
        let records: Vec<Arc<Mutex<Job>>> = self
            .jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut jobs: Vec<Job> = records.iter().map(|record| record.lock().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    fn scan<T>(&self, mut pick: impl FnMut(&Job) -> Option<T>) -> Vec<T> {
        let records: Vec<Arc<Mutex<Job>>> = self
            .jobs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        records
            .iter()
            .filter_map(|record| pick(&*record.lock()))
            .collect()
    }

    /// Pending/Running jobs grouped by backend
    pub fn outstanding(&self) -> BTreeMap<BackendKind, Vec<OutstandingJob>> {
        let mut grouped: BTreeMap<BackendKind, Vec<OutstandingJob>> = BTreeMap::new();
        for (backend, job) in self.scan(|job| {
            let handle = job.backend_handle.as_ref()?;
            job.state.is_outstanding().then(|| {
                (
                    job.backend_kind,
                    OutstandingJob {
                        id: job.id.clone(),
                        handle: handle.clone(),
                    },
                )
            })
        }) {
            grouped.entry(backend).or_default().push(job);
        }
        grouped
    }

    pub fn outstanding_count(&self) -> usize {
        self.scan(|job| job.state.is_outstanding().then_some(())).len()
    }

    /// Jobs whose scheduled resubmission is due, earliest first
    pub fn due_retries(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut due = self.scan(|job| {
            let retry = job.scheduled_retry.as_ref()?;
            (retry.due_at <= now).then(|| (retry.due_at, job.id.clone()))
        });
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Earliest scheduled resubmission, if any
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.scan(|job| job.scheduled_retry.as_ref().map(|r| r.due_at))
            .into_iter()
            .min()
    }

    /// Outstanding jobs whose requested cancel the backend never confirmed
    pub fn pending_cancels(&self) -> Vec<(JobId, BackendKind, BackendHandle)> {
        self.scan(|job| {
            let handle = job.backend_handle.as_ref()?;
            (job.cancel_requested && job.state.is_outstanding())
                .then(|| (job.id.clone(), job.backend_kind, handle.clone()))
        })
    }

    /// Jobs caught in `Submitting` (used after a restart)
    pub fn submitting(&self) -> Vec<JobId> {
        self.scan(|job| matches!(job.state, JobState::Submitting).then(|| job.id.clone()))
    }

    /// Failed jobs the retry policy has not ruled on yet
    pub fn undecided_failures(&self) -> Vec<JobId> {
        self.scan(|job| {
            (job.state.is_retryable_failure()
                && job.scheduled_retry.is_none()
                && !job.retry_exhausted)
                .then(|| job.id.clone())
        })
    }

    /// State change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> RegistrySnapshot {
        RegistrySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at,
            jobs: self.list(),
        }
    }

    /// Load records from a snapshot, validating each against its history.
    ///
    /// Every record is checked before any is inserted, so a bad snapshot
    /// leaves the registry as it was.
    pub fn restore(&self, snapshot: RegistrySnapshot) -> Result<usize> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(OrchestratorError::serialization(format!(
                "unsupported registry snapshot version {} (expected {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let mut seen = HashSet::with_capacity(snapshot.jobs.len());
        for job in &snapshot.jobs {
            if !seen.insert(&job.id) || self.contains(&job.id) {
                return Err(OrchestratorError::DuplicateJob(job.id.clone()));
            }
            job.check_invariants()?;
            let replayed = JobStateMachine::replay(&job.history)?;
            if replayed != job.state {
                return Err(OrchestratorError::serialization(format!(
                    "job {}: history leads to {} but record says {}",
                    job.id, replayed, job.state
                )));
            }
        }

        let count = snapshot.jobs.len();
        let mut inserted = Vec::with_capacity(count);
        for job in snapshot.jobs {
            let id = job.id.clone();
            if let Err(e) = self.insert(job) {
                // Lost a race with a concurrent insert; undo this restore
                for id in &inserted {
                    self.jobs.remove(id);
                }
                return Err(e);
            }
            inserted.push(id);
        }
        Ok(count)
    }

    /// Write a snapshot to `store`
    pub async fn persist(
        &self,
        store: &dyn SnapshotStore,
        now: DateTime<Utc>,
    ) -> Result<SnapshotMeta> {
        let snapshot = self.snapshot(now);
        let jobs = snapshot.jobs.len();
        let record = SnapshotRecord::at(
            snapshot.format_version,
            snapshot.saved_at,
            serde_json::to_value(&snapshot)?,
        );
        let meta = store.save(&record).await?;
        info!(
            "Persisted {} job(s) as snapshot #{} ({} bytes)",
            jobs, meta.sequence, meta.size_bytes
        );
        Ok(meta)
    }

    /// Restore from the latest snapshot in `store`. Returns the number of jobs loaded.
    pub async fn reload(&self, store: &dyn SnapshotStore) -> Result<usize> {
        let Some(record) = store.load_latest().await? else {
            info!("No registry snapshot found, starting empty");
            return Ok(0);
        };
        let snapshot: RegistrySnapshot = serde_json::from_value(record.payload)?;
        let count = self.restore(snapshot)?;
        info!("Reloaded {} job(s) from snapshot saved at {}", count, record.saved_at);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use batchflow_storage::InMemorySnapshotStore;

    fn registry_with(ids: &[&str]) -> JobRegistry {
        let registry = JobRegistry::new();
        for id in ids {
            registry
                .insert(Job::from_spec(
                    JobSpec::inline("true", BackendKind::Slurm).with_id(*id),
                    Utc::now(),
                ))
                .unwrap();
        }
        registry
    }

    fn submit(registry: &JobRegistry, id: &JobId, handle: &str) {
        registry
            .transition(id, Utc::now(), |sm| {
                sm.begin_submission()?;
                sm.submission_succeeded(BackendHandle::new(handle))
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = registry_with(&["a"]);
        let again = Job::from_spec(
            JobSpec::inline("true", BackendKind::Local).with_id("a"),
            Utc::now(),
        );
        assert!(matches!(
            registry.insert(again),
            Err(OrchestratorError::DuplicateJob(_))
        ));
    }

    #[test]
    fn test_failed_update_commits_nothing() {
        let registry = registry_with(&["a"]);
        let id = JobId::new("a");
        let before = registry.get(&id).unwrap();

        let result = registry.transition(&id, Utc::now(), |sm| {
            sm.begin_submission()?;
            // Nothing reached the backend yet, so there is nothing to confirm
            sm.cancel_confirmed()
        });

        assert!(result.is_err());
        assert_eq!(registry.get(&id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_events_for_each_transition() {
        let registry = registry_with(&["a"]);
        let mut events = registry.subscribe();
        let id = JobId::new("a");

        submit(&registry, &id, "42");

        let first = events.recv().await.unwrap();
        assert_eq!((first.from, first.to), (JobState::Defined, JobState::Submitting));
        let second = events.recv().await.unwrap();
        assert_eq!((second.from, second.to), (JobState::Submitting, JobState::Pending));
        assert_eq!(second.attempt, 1);
    }

    #[test]
    fn test_outstanding_grouped_by_backend() {
        let registry = registry_with(&["a", "b", "c"]);
        submit(&registry, &JobId::new("a"), "1");
        submit(&registry, &JobId::new("b"), "2");

        let outstanding = registry.outstanding();
        assert_eq!(outstanding.len(), 1);
        let mut handles: Vec<_> = outstanding[&BackendKind::Slurm]
            .iter()
            .map(|o| o.handle.as_str().to_string())
            .collect();
        handles.sort();
        assert_eq!(handles, vec!["1", "2"]);
        assert_eq!(registry.outstanding_count(), 2);
    }

    #[test]
    fn test_remove_only_terminal() {
        let registry = registry_with(&["a"]);
        let id = JobId::new("a");
        assert!(registry.remove(&id).is_err());

        registry
            .transition(&id, Utc::now(), |sm| sm.cancel_unsubmitted("not needed"))
            .unwrap();
        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.state, JobState::Cancelled);
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn test_persist_and_reload_roundtrip() {
        let registry = registry_with(&["a", "b"]);
        submit(&registry, &JobId::new("a"), "77");
        let store = InMemorySnapshotStore::new();

        registry.persist(&store, Utc::now()).await.unwrap();

        let reloaded = JobRegistry::new();
        assert_eq!(reloaded.reload(&store).await.unwrap(), 2);
        assert_eq!(reloaded.list(), registry.list());
    }

    #[tokio::test]
    async fn test_reload_from_empty_store() {
        let registry = JobRegistry::new();
        let store = InMemorySnapshotStore::new();
        assert_eq!(registry.reload(&store).await.unwrap(), 0);
    }

    #[test]
    fn test_restore_rejects_tampered_state() {
        let registry = registry_with(&["a"]);
        let mut snapshot = registry.snapshot(Utc::now());
        snapshot.jobs[0].state = JobState::Running;

        let fresh = JobRegistry::new();
        assert!(fresh.restore(snapshot).is_err());
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_restore_rejects_unknown_version() {
        let registry = registry_with(&["a"]);
        let mut snapshot = registry.snapshot(Utc::now());
        snapshot.format_version = 99;
        assert!(JobRegistry::new().restore(snapshot).is_err());
    }

    #[test]
    fn test_restore_rejects_repeated_id_without_inserting() {
        let registry = registry_with(&["a", "b"]);
        let mut snapshot = registry.snapshot(Utc::now());
        let repeated = snapshot.jobs[0].clone();
        snapshot.jobs.push(repeated);

        let fresh = JobRegistry::new();
        assert!(matches!(
            fresh.restore(snapshot),
            Err(OrchestratorError::DuplicateJob(id)) if id.as_str() == "a"
        ));
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_restore_checks_every_record_before_inserting() {
        let registry = registry_with(&["a", "b"]);
        submit(&registry, &JobId::new("b"), "9");
        let mut snapshot = registry.snapshot(Utc::now());
        // History still replays, but a pending job must carry a handle
        snapshot.jobs[1].backend_handle = None;

        let fresh = JobRegistry::new();
        assert!(fresh.restore(snapshot).is_err());
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_pending_cancels_lists_unconfirmed_requests() {
        let registry = registry_with(&["a", "b", "c"]);
        submit(&registry, &JobId::new("a"), "1");
        submit(&registry, &JobId::new("b"), "2");
        for id in ["a", "c"] {
            registry
                .transition(&JobId::new(id), Utc::now(), |sm| {
                    sm.request_cancel();
                    Ok(())
                })
                .unwrap();
        }

        // "c" never reached a backend
        assert_eq!(
            registry.pending_cancels(),
            vec![(JobId::new("a"), BackendKind::Slurm, BackendHandle::new("1"))]
        );
    }
}
