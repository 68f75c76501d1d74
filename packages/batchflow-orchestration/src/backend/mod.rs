//! Execution backends
//!
//! Every backend (cluster scheduler or local process runner) implements
//! `BackendAdapter`: submit, query status, cancel. Backend-specific status
//! vocabularies are reduced to `NormalizedState` inside the adapter, so the
//! engine never sees a scheduler's own state names.
//!
//! Cluster adapters talk to their scheduler through a `CommandRunner`, which
//! keeps the CLI boundary swappable (tests script the scheduler's output).

pub mod htcondor;
pub mod local;
pub mod slurm;

pub use htcondor::{HTCondorBackend, HTCondorOptions};
pub use local::LocalBackend;
pub use slurm::{SlurmBackend, SlurmOptions};

use crate::error::{CancelError, OrchestratorError, QueryError, Result, SubmissionError};
use crate::job::{BackendHandle, BackendKind, Job, JobId, ResourceRequest, ScriptRef};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Canonical, backend-agnostic job status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedState {
    Pending,
    Running,
    Succeeded,
    Failed { detail: Option<String> },
    Cancelled,
    /// Ambiguous response or handle not known to the backend
    Unknown,
}

impl NormalizedState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NormalizedState::Succeeded | NormalizedState::Failed { .. } | NormalizedState::Cancelled
        )
    }
}

/// Everything an adapter needs to submit one attempt of a job
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub name: String,
    pub script: ScriptRef,
    pub run_args: Vec<String>,
    pub resources: ResourceRequest,
    pub log: Option<PathBuf>,
}

impl SubmitRequest {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            script: job.script.clone(),
            run_args: job.run_args.clone(),
            resources: job.resources.clone(),
            log: job.log.clone(),
        }
    }
}

/// Backend adapter trait (one implementation per backend kind)
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Which backend tag this adapter serves
    fn kind(&self) -> BackendKind;

    /// Hand the job to the backend and return its handle
    async fn submit(&self, request: &SubmitRequest) -> std::result::Result<BackendHandle, SubmissionError>;

    /// Status of one submitted job
    async fn query_status(
        &self,
        handle: &BackendHandle,
    ) -> std::result::Result<NormalizedState, QueryError>;

    /// Whether `query_status_batch` is a single call to the backend
    fn supports_batch_query(&self) -> bool {
        false
    }

    /// Status of many jobs. Handles missing from the result are `Unknown`.
    async fn query_status_batch(
        &self,
        handles: &[BackendHandle],
    ) -> std::result::Result<HashMap<BackendHandle, NormalizedState>, QueryError> {
        let mut states = HashMap::with_capacity(handles.len());
        for handle in handles {
            states.insert(handle.clone(), self.query_status(handle).await?);
        }
        Ok(states)
    }

    /// Cancel a submitted job. `Ok` means the backend confirmed the cancellation.
    async fn cancel(&self, handle: &BackendHandle) -> std::result::Result<(), CancelError>;
}

/// Poll `query_status` until it reports `Cancelled`.
///
/// Schedulers often need a moment before a cancelled job shows up as such;
/// anything other than `Cancelled` after the last attempt is `Unverifiable`.
pub(crate) async fn verify_cancelled(
    adapter: &(impl BackendAdapter + ?Sized),
    handle: &BackendHandle,
    attempts: u32,
    delay: Duration,
) -> std::result::Result<(), CancelError> {
    let mut last = String::from("no status observed");
    for attempt in 0..attempts.max(1) {
        if attempt > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match adapter.query_status(handle).await {
            Ok(NormalizedState::Cancelled) => return Ok(()),
            Ok(state) => last = format!("backend reports {:?}", state),
            Err(e) => last = format!("status query failed: {}", e),
        }
    }
    Err(CancelError::unverifiable(format!(
        "{} {}: {}",
        adapter.kind(),
        handle,
        last
    )))
}

/// Adapters by backend tag
#[derive(Clone, Default)]
pub struct BackendSet {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same kind
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(OrchestratorError::BackendNotRegistered(kind))
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// One scheduler CLI invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the command's stdin, then stdin is closed
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs scheduler commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands as child processes of this process
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, command: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!("Running: {}", command);

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("'{}' timed out after {:?}", command.program, self.timeout),
                )
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
