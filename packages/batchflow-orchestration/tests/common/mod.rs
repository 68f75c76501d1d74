//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use batchflow_orchestration::{
    BackendAdapter, BackendHandle, BackendKind, BackendSet, CancelError, EngineConfig,
    JobOrchestrator, ManualClock, NormalizedState, PollerConfig, QueryError, RetryPolicy,
    SubmissionError, SubmitRequest,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// In-memory stand-in for a cluster scheduler.
///
/// Submissions succeed unless a failure was queued with `fail_next`. Every
/// accepted job starts `Pending`; statuses change only through `set_status`.
pub struct ScriptedBackend {
    kind: BackendKind,
    batch: bool,
    failures: Mutex<VecDeque<SubmissionError>>,
    always_fail: Mutex<Option<SubmissionError>>,
    cancel_failures: Mutex<VecDeque<CancelError>>,
    states: Mutex<HashMap<BackendHandle, NormalizedState>>,
    next_handle: AtomicU64,
    pub submit_calls: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    hold: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self::build(kind, true))
    }

    pub fn unbatched(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self::build(kind, false))
    }

    fn build(kind: BackendKind, batch: bool) -> Self {
        Self {
            kind,
            batch,
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            cancel_failures: Mutex::new(VecDeque::new()),
            states: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1000),
            submit_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            hold: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, error: SubmissionError) {
        self.failures.lock().push_back(error);
    }

    pub fn fail_always(&self, error: SubmissionError) {
        *self.always_fail.lock() = Some(error);
    }

    /// Refuse the next cancel with `error`
    pub fn fail_next_cancel(&self, error: CancelError) {
        self.cancel_failures.lock().push_back(error);
    }

    pub fn set_status(&self, handle: &BackendHandle, state: NormalizedState) {
        self.states.lock().insert(handle.clone(), state);
    }

    /// Make the handle unknown to the backend
    pub fn forget(&self, handle: &BackendHandle) {
        self.states.lock().remove(handle);
    }

    pub fn submits(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Block submissions until `release` is called; returns a signal fired
    /// when a submission is waiting
    pub fn hold_submissions(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.hold.lock() = Some((entered.clone(), release.clone()));
        (entered, release)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn submit(&self, _request: &SubmitRequest) -> Result<BackendHandle, SubmissionError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let hold = self.hold.lock().clone();
        if let Some((entered, release)) = hold {
            entered.notify_one();
            release.notified().await;
        }

        if let Some(error) = self.always_fail.lock().clone() {
            return Err(error);
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let handle = BackendHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst).to_string());
        self.set_status(&handle, NormalizedState::Pending);
        Ok(handle)
    }

    async fn query_status(&self, handle: &BackendHandle) -> Result<NormalizedState, QueryError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .states
            .lock()
            .get(handle)
            .cloned()
            .unwrap_or(NormalizedState::Unknown))
    }

    fn supports_batch_query(&self) -> bool {
        self.batch
    }

    async fn query_status_batch(
        &self,
        handles: &[BackendHandle],
    ) -> Result<HashMap<BackendHandle, NormalizedState>, QueryError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let states = self.states.lock();
        Ok(handles
            .iter()
            .filter_map(|h| states.get(h).map(|s| (h.clone(), s.clone())))
            .collect())
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), CancelError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.cancel_failures.lock().pop_front() {
            return Err(error);
        }
        let mut states = self.states.lock();
        match states.get(handle) {
            Some(NormalizedState::Pending | NormalizedState::Running) => {
                states.insert(handle.clone(), NormalizedState::Cancelled);
                Ok(())
            }
            Some(other) => Err(CancelError::unverifiable(format!(
                "{} is {:?}",
                handle, other
            ))),
            None => Err(CancelError::rejected(format!("unknown job {}", handle))),
        }
    }
}

pub fn config(retry: RetryPolicy, grace: u32, backends: &[BackendKind]) -> EngineConfig {
    EngineConfig {
        default_backend: backends[0],
        enabled_backends: backends.to_vec(),
        poller: PollerConfig {
            interval_ms: 20,
            lost_track_grace_polls: grace,
        },
        retry,
        ..Default::default()
    }
}

/// Engine over scripted backends with a manual clock
pub fn engine(
    retry: RetryPolicy,
    grace: u32,
    adapters: &[Arc<ScriptedBackend>],
) -> (JobOrchestrator, Arc<ManualClock>) {
    let kinds: Vec<BackendKind> = adapters.iter().map(|a| a.kind()).collect();
    engine_with_config(config(retry, grace, &kinds), adapters)
}

pub fn engine_with_config(
    config: EngineConfig,
    adapters: &[Arc<ScriptedBackend>],
) -> (JobOrchestrator, Arc<ManualClock>) {
    let mut set = BackendSet::new();
    for adapter in adapters {
        set.register(adapter.clone());
    }
    let clock = Arc::new(ManualClock::default());
    let engine = JobOrchestrator::new(&config, set)
        .expect("valid test config")
        .with_clock(clock.clone());
    (engine, clock)
}
