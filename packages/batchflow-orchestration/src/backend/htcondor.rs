//! HTCondor adapter.
//!
//! Submission pipes a submit description into `condor_submit -terse`.
//! Status comes from `condor_q`, falling back to `condor_history` for jobs
//! that already left the queue.

use super::{
    verify_cancelled, BackendAdapter, CommandRunner, CommandSpec, NormalizedState, SubmitRequest,
    SystemCommandRunner,
};
use crate::error::{CancelError, QueryError, SubmissionError};
use crate::job::{BackendHandle, BackendKind, ScriptRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HTCondorOptions {
    pub condor_submit: String,
    pub condor_q: String,
    pub condor_history: String,
    pub condor_rm: String,
    pub universe: String,
    pub cancel_verify_attempts: u32,
    pub cancel_verify_delay_ms: u64,
}

impl Default for HTCondorOptions {
    fn default() -> Self {
        Self {
            condor_submit: "condor_submit".to_string(),
            condor_q: "condor_q".to_string(),
            condor_history: "condor_history".to_string(),
            condor_rm: "condor_rm".to_string(),
            universe: "vanilla".to_string(),
            cancel_verify_attempts: 5,
            cancel_verify_delay_ms: 1000,
        }
    }
}

pub struct HTCondorBackend {
    runner: Arc<dyn CommandRunner>,
    options: HTCondorOptions,
}

/// Quote an argument list in HTCondor's "new" arguments syntax
fn quote_arguments(args: &[String]) -> String {
    let quoted: Vec<String> = args
        .iter()
        .map(|arg| format!("'{}'", arg.replace('"', "\"\"").replace('\'', "''")))
        .collect();
    format!("\"{}\"", quoted.join(" "))
}

fn map_job_status(status: &str, exit_code: &str) -> NormalizedState {
    match status {
        // Idle, Held
        "1" | "5" => NormalizedState::Pending,
        // Running, Transferring Output, Suspended
        "2" | "6" | "7" => NormalizedState::Running,
        "3" => NormalizedState::Cancelled,
        "4" if exit_code == "0" => NormalizedState::Succeeded,
        "4" => NormalizedState::Failed {
            detail: Some(format!("exit code {}", exit_code)),
        },
        _ => NormalizedState::Unknown,
    }
}

impl HTCondorBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, options: HTCondorOptions) -> Self {
        Self { runner, options }
    }

    /// HTCondor on the local PATH with default options
    pub fn system() -> Self {
        Self::new(Arc::new(SystemCommandRunner::default()), HTCondorOptions::default())
    }

    /// Submit description for one job
    pub fn submit_description(&self, request: &SubmitRequest) -> String {
        let mut desc = String::new();
        let res = &request.resources;

        let _ = writeln!(desc, "universe = {}", self.options.universe);
        match &request.script {
            ScriptRef::Path(path) => {
                let _ = writeln!(desc, "executable = {}", path.display());
                if !request.run_args.is_empty() {
                    let _ = writeln!(desc, "arguments = {}", quote_arguments(&request.run_args));
                }
            }
            ScriptRef::Inline(command) => {
                let mut args = vec!["-c".to_string(), command.clone(), request.name.clone()];
                args.extend(request.run_args.iter().cloned());
                let _ = writeln!(desc, "executable = /bin/sh");
                let _ = writeln!(desc, "arguments = {}", quote_arguments(&args));
            }
        }
        let _ = writeln!(desc, "batch_name = {}", request.name);
        if let Some(log) = &request.log {
            let _ = writeln!(desc, "output = {}", log.display());
            let _ = writeln!(desc, "error = {}", log.display());
        }
        if let Some(cores) = res.cores {
            let _ = writeln!(desc, "request_cpus = {}", cores);
        }
        if let Some(memory) = &res.memory {
            let _ = writeln!(desc, "request_memory = {}", memory);
        }
        if res.export.as_deref() == Some("ALL") {
            let _ = writeln!(desc, "getenv = true");
        }
        for (key, value) in &res.extra {
            let _ = writeln!(desc, "{} = {}", key, value);
        }
        let _ = writeln!(desc, "queue 1");
        desc
    }

    /// Job id from `condor_submit -terse` output (`123.0 - 123.0`)
    pub fn parse_submit_output(stdout: &str) -> Option<String> {
        let first = stdout.split_whitespace().next()?;
        let (cluster, proc_id) = first.split_once('.')?;
        let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        (numeric(cluster) && numeric(proc_id)).then(|| first.to_string())
    }

    /// Parse `-af:j JobStatus ExitCode` rows (`123.0 4 0`)
    pub fn parse_status_rows(output: &str) -> HashMap<String, NormalizedState> {
        output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let id = fields.next()?;
                let status = fields.next()?;
                let exit_code = fields.next().unwrap_or("undefined");
                Some((id.to_string(), map_job_status(status, exit_code)))
            })
            .collect()
    }

    fn status_command(program: &str, ids: &[&str]) -> CommandSpec {
        let mut args: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        args.extend(["-af:j", "JobStatus", "ExitCode"].map(String::from));
        CommandSpec::new(program, args)
    }
}

#[async_trait]
impl BackendAdapter for HTCondorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HTCondor
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, SubmissionError> {
        let command = CommandSpec::new(&self.options.condor_submit, ["-terse"])
            .with_stdin(self.submit_description(request));
        debug!("({}) Submit job with command {}", request.name, command);

        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| SubmissionError::from_io(&e))?;
        if !output.success {
            let stderr = output.stderr.trim();
            let message = format!("condor_submit failed: {}", stderr);
            return Err(if stderr.contains("ERROR: on Line") || stderr.contains("not found") {
                SubmissionError::permanent(message)
            } else {
                SubmissionError::transient(message)
            });
        }

        Self::parse_submit_output(&output.stdout)
            .map(BackendHandle::new)
            .ok_or_else(|| {
                SubmissionError::transient(format!(
                    "could not parse job id from condor_submit output: {:?}",
                    output.stdout.trim()
                ))
            })
    }

    async fn query_status(&self, handle: &BackendHandle) -> Result<NormalizedState, QueryError> {
        let mut states = self.query_status_batch(std::slice::from_ref(handle)).await?;
        Ok(states.remove(handle).unwrap_or(NormalizedState::Unknown))
    }

    fn supports_batch_query(&self) -> bool {
        true
    }

    async fn query_status_batch(
        &self,
        handles: &[BackendHandle],
    ) -> Result<HashMap<BackendHandle, NormalizedState>, QueryError> {
        if handles.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<&str> = handles.iter().map(BackendHandle::as_str).collect();
        let output = self
            .runner
            .run(&Self::status_command(&self.options.condor_q, &ids))
            .await?;
        if !output.success {
            return Err(QueryError::new(format!(
                "condor_q failed: {}",
                output.stderr.trim()
            )));
        }
        let mut parsed = Self::parse_status_rows(&output.stdout);

        let missing: Vec<&str> = ids
            .iter()
            .copied()
            .filter(|id| !parsed.contains_key(*id))
            .collect();
        if !missing.is_empty() {
            match self
                .runner
                .run(&Self::status_command(&self.options.condor_history, &missing))
                .await
            {
                Ok(history) if history.success => {
                    parsed.extend(Self::parse_status_rows(&history.stdout));
                }
                Ok(history) => warn!("condor_history failed: {}", history.stderr.trim()),
                Err(e) => warn!("condor_history failed: {}", e),
            }
        }

        Ok(handles
            .iter()
            .map(|handle| {
                let state = parsed
                    .remove(handle.as_str())
                    .unwrap_or(NormalizedState::Unknown);
                (handle.clone(), state)
            })
            .collect())
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), CancelError> {
        let command = CommandSpec::new(&self.options.condor_rm, [handle.as_str()]);
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| CancelError::rejected(e.to_string()))?;
        if !output.success {
            return Err(CancelError::rejected(format!(
                "condor_rm failed: {}",
                output.stderr.trim()
            )));
        }

        verify_cancelled(
            self,
            handle,
            self.options.cancel_verify_attempts,
            Duration::from_millis(self.options.cancel_verify_delay_ms),
        )
        .await
    }
}
