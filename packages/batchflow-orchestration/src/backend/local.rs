//! Local process backend.
//!
//! Jobs run as child processes of the engine, each in its own process group.
//! The handle is `<pid>-<sequence>`, unique for the backend's lifetime even
//! when the OS reuses a pid. Status is read per process with a non-blocking
//! `try_wait`; a process is forgotten once its end has been reported.

use super::{BackendAdapter, NormalizedState, SubmitRequest};
use crate::error::{CancelError, QueryError, SubmissionError};
use crate::job::{BackendHandle, BackendKind, ScriptRef};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Environment variable carrying the job id into the process
pub const JOB_ID_ENV: &str = "BATCHFLOW_JOB_ID";

enum LocalProcess {
    Running(Child),
    /// Exit code, `None` when terminated by a signal
    Exited(Option<i32>),
    Killed,
}

#[derive(Default)]
pub struct LocalBackend {
    processes: DashMap<BackendHandle, Arc<Mutex<LocalProcess>>>,
    started: AtomicU64,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes whose end has not been reported yet
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    fn command(request: &SubmitRequest) -> Command {
        match &request.script {
            ScriptRef::Path(path) => {
                let mut command = Command::new(path);
                command.args(&request.run_args);
                command
            }
            ScriptRef::Inline(line) => {
                // sh -c <line> <$0> <$1>...
                let mut command = Command::new("sh");
                command
                    .arg("-c")
                    .arg(line)
                    .arg(&request.name)
                    .args(&request.run_args);
                command
            }
        }
    }

    fn lookup(&self, handle: &BackendHandle) -> Option<Arc<Mutex<LocalProcess>>> {
        self.processes.get(handle).map(|entry| Arc::clone(entry.value()))
    }
}

/// Kill the job's whole process group, then reap the child
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)?;
            child.wait().await?;
            return Ok(());
        }
    }
    child.kill().await
}

fn exit_state(code: Option<i32>) -> NormalizedState {
    match code {
        Some(0) => NormalizedState::Succeeded,
        Some(code) => NormalizedState::Failed {
            detail: Some(format!("exit code {}", code)),
        },
        None => NormalizedState::Failed {
            detail: Some("terminated by signal".to_string()),
        },
    }
}

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, SubmissionError> {
        let mut command = Self::command(request);
        command.env(JOB_ID_ENV, request.job_id.as_str()).stdin(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        match &request.log {
            Some(path) => {
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        SubmissionError::permanent(format!(
                            "cannot open log file {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                let err_log = log.try_clone().map_err(|e| SubmissionError::from_io(&e))?;
                command.stdout(log).stderr(err_log);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = command.spawn().map_err(|e| SubmissionError::from_io(&e))?;
        let pid = child
            .id()
            .ok_or_else(|| SubmissionError::transient("spawned process has no pid"))?;
        let sequence = self.started.fetch_add(1, Ordering::Relaxed);
        let handle = BackendHandle::new(format!("{}-{}", pid, sequence));

        info!("({}) Started local process {}", request.name, pid);
        self.processes
            .insert(handle.clone(), Arc::new(Mutex::new(LocalProcess::Running(child))));
        Ok(handle)
    }

    async fn query_status(&self, handle: &BackendHandle) -> Result<NormalizedState, QueryError> {
        let Some(process) = self.lookup(handle) else {
            return Ok(NormalizedState::Unknown);
        };

        let state = {
            let mut process = process.lock().await;
            match &mut *process {
                LocalProcess::Running(child) => match child.try_wait()? {
                    Some(status) => {
                        debug!("Local process {} exited with {:?}", handle, status.code());
                        exit_state(status.code())
                    }
                    None => return Ok(NormalizedState::Running),
                },
                LocalProcess::Exited(code) => exit_state(*code),
                LocalProcess::Killed => NormalizedState::Cancelled,
            }
        };

        // Reported once; the engine stops polling settled jobs
        self.processes.remove(handle);
        Ok(state)
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), CancelError> {
        let process = self
            .lookup(handle)
            .ok_or_else(|| CancelError::rejected(format!("no local process {}", handle)))?;

        let mut process = process.lock().await;
        match &mut *process {
            LocalProcess::Running(child) => {
                if let Ok(Some(status)) = child.try_wait() {
                    *process = LocalProcess::Exited(status.code());
                    return Err(CancelError::unverifiable(format!(
                        "process {} exited before it could be killed",
                        handle
                    )));
                }
                terminate(child)
                    .await
                    .map_err(|e| CancelError::rejected(format!("kill {}: {}", handle, e)))?;
                *process = LocalProcess::Killed;
                self.processes.remove(handle);
                info!("Killed local process {}", handle);
                Ok(())
            }
            LocalProcess::Exited(_) => Err(CancelError::unverifiable(format!(
                "process {} already exited",
                handle
            ))),
            LocalProcess::Killed => Ok(()),
        }
    }
}
