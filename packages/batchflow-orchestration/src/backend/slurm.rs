//! Slurm adapter: `sbatch` to submit, `sacct` to query, `scancel` to cancel.

use super::{
    verify_cancelled, BackendAdapter, CommandRunner, CommandSpec, NormalizedState, SubmitRequest,
    SystemCommandRunner,
};
use crate::error::{CancelError, QueryError, SubmissionError};
use crate::job::{BackendHandle, BackendKind, ScriptRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exit code `sacct` reports for a clean exit
const SUCCESS_EXIT_CODE: &str = "0:0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmOptions {
    pub sbatch: String,
    pub sacct: String,
    pub scancel: String,
    /// Status checks after `scancel` before giving up on confirmation
    pub cancel_verify_attempts: u32,
    pub cancel_verify_delay_ms: u64,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            cancel_verify_attempts: 5,
            cancel_verify_delay_ms: 1000,
        }
    }
}

pub struct SlurmBackend {
    runner: Arc<dyn CommandRunner>,
    options: SlurmOptions,
}

impl SlurmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, options: SlurmOptions) -> Self {
        Self { runner, options }
    }

    /// Slurm on the local PATH with default options
    pub fn system() -> Self {
        Self::new(Arc::new(SystemCommandRunner::default()), SlurmOptions::default())
    }

    /// `sbatch` arguments for a request
    pub fn submit_args(request: &SubmitRequest) -> Vec<String> {
        let mut args = vec!["-J".to_string(), request.name.clone()];
        let res = &request.resources;

        if let Some(log) = &request.log {
            args.push("-o".to_string());
            args.push(log.display().to_string());
        }
        if let Some(partition) = &res.partition {
            args.push("-p".to_string());
            args.push(partition.clone());
        }
        if let Some(exclude) = &res.exclude {
            args.push("-x".to_string());
            args.push(exclude.clone());
        }
        if let Some(clusters) = &res.clusters {
            args.push("-M".to_string());
            args.push(clusters.clone());
        }
        if let Some(qos) = &res.qos {
            args.push(format!("--qos={}", qos));
        }
        if let Some(mem) = &res.memory {
            args.push(format!("--mem={}", mem));
        }
        if let Some(time) = &res.wall_time {
            args.push(format!("--time={}", time));
        }
        if let Some(export) = &res.export {
            args.push(format!("--export={}", export));
        }
        if let Some(cores) = res.cores {
            args.push(format!("--cpus-per-task={}", cores));
        }
        for (key, value) in &res.extra {
            args.push(format!("--{}={}", key, value));
        }

        match &request.script {
            ScriptRef::Path(path) => {
                args.push(path.display().to_string());
                args.extend(request.run_args.iter().cloned());
            }
            ScriptRef::Inline(command) => {
                let mut wrapped = command.clone();
                for arg in &request.run_args {
                    wrapped.push(' ');
                    wrapped.push_str(arg);
                }
                args.push(format!("--wrap={}", wrapped));
            }
        }
        args
    }

    /// Job id and cluster from `Submitted batch job 1234 [on cluster b]` or
    /// `--parsable` output `1234;b`
    pub fn parse_submit_output(stdout: &str) -> Option<(String, Option<String>)> {
        let tokens: Vec<&str> = stdout.split_whitespace().collect();
        let named_cluster = tokens
            .windows(3)
            .find(|w| w[0] == "on" && w[1] == "cluster")
            .map(|w| w[2].to_string());

        tokens.iter().rev().find_map(|token| {
            let (id, cluster) = match token.split_once(';') {
                Some((id, cluster)) => (id, Some(cluster)),
                None => (*token, None),
            };
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let cluster = cluster
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .or_else(|| named_cluster.clone());
            Some((id.to_string(), cluster))
        })
    }

    /// Handle for a job id, `id;cluster` when the job went to a named cluster
    pub fn handle_for(job_id: &str, cluster: Option<&str>) -> BackendHandle {
        match cluster {
            Some(cluster) => BackendHandle::new(format!("{};{}", job_id, cluster)),
            None => BackendHandle::new(job_id),
        }
    }

    /// Job id and cluster carried by a handle
    pub fn split_handle(handle: &BackendHandle) -> (&str, Option<&str>) {
        match handle.as_str().split_once(';') {
            Some((id, cluster)) if !cluster.is_empty() => (id, Some(cluster)),
            Some((id, _)) => (id, None),
            None => (handle.as_str(), None),
        }
    }

    /// Parse `sacct -P -o JobID,State,ExitCode` output (header line included)
    pub fn parse_sacct(output: &str) -> HashMap<String, NormalizedState> {
        let mut states = HashMap::new();
        for line in output.lines().skip(1) {
            let mut fields = line.split('|');
            let (Some(job_id), Some(state), Some(exit_code)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            // job steps (.batch, .extern, .0) carry their own rows
            if job_id.contains('.') || job_id.is_empty() {
                continue;
            }
            states.insert(job_id.to_string(), map_state(state, exit_code));
        }
        states
    }

    fn classify_submit_failure(stderr: &str) -> SubmissionError {
        let lower = stderr.to_ascii_lowercase();
        let message = format!("sbatch failed: {}", stderr.trim());
        if lower.contains("invalid")
            || lower.contains("not available")
            || lower.contains("unrecognized option")
            || lower.contains("exceeds")
        {
            SubmissionError::permanent(message)
        } else {
            SubmissionError::transient(message)
        }
    }
}

fn map_state(state: &str, exit_code: &str) -> NormalizedState {
    // e.g. "CANCELLED by 1000"
    let state = state.split_whitespace().next().unwrap_or("");
    match state {
        "PENDING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" | "RESV_DEL_HOLD"
        | "CONFIGURING" | "RESIZING" => NormalizedState::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "SUSPENDED" | "STOPPED" => {
            NormalizedState::Running
        }
        "COMPLETED" if exit_code == SUCCESS_EXIT_CODE => NormalizedState::Succeeded,
        "COMPLETED" => NormalizedState::Failed {
            detail: Some(format!("exit code {}", exit_code)),
        },
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "REVOKED" => NormalizedState::Failed {
            detail: Some(format!("{} (exit code {})", state, exit_code)),
        },
        "CANCELLED" => NormalizedState::Cancelled,
        _ => NormalizedState::Unknown,
    }
}

#[async_trait]
impl BackendAdapter for SlurmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, SubmissionError> {
        let command = CommandSpec::new(&self.options.sbatch, Self::submit_args(request));
        debug!("({}) Submit job with command {}", request.name, command);

        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| SubmissionError::from_io(&e))?;
        if !output.success {
            return Err(Self::classify_submit_failure(&output.stderr));
        }

        // Without a cluster in the output the job went to the one(s) requested
        Self::parse_submit_output(&output.stdout)
            .map(|(id, cluster)| {
                let cluster = cluster.or_else(|| request.resources.clusters.clone());
                Self::handle_for(&id, cluster.as_deref())
            })
            .ok_or_else(|| {
                SubmissionError::transient(format!(
                    "could not parse job id from sbatch output: {:?}",
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

        // sacct only sees the local cluster unless told otherwise
        let mut by_cluster: BTreeMap<Option<&str>, Vec<(&BackendHandle, &str)>> = BTreeMap::new();
        for handle in handles {
            let (id, cluster) = Self::split_handle(handle);
            by_cluster.entry(cluster).or_default().push((handle, id));
        }

        let mut states = HashMap::with_capacity(handles.len());
        for (cluster, jobs) in by_cluster {
            let ids: Vec<&str> = jobs.iter().map(|(_, id)| *id).collect();
            let mut args = vec![
                "-P".to_string(),
                "-o".to_string(),
                "JobID,State,ExitCode".to_string(),
                "-j".to_string(),
                ids.join(","),
            ];
            if let Some(cluster) = cluster {
                args.push("-M".to_string());
                args.push(cluster.to_string());
            }

            let output = self
                .runner
                .run(&CommandSpec::new(&self.options.sacct, args))
                .await?;
            if !output.success {
                return Err(QueryError::new(format!(
                    "sacct failed: {}",
                    output.stderr.trim()
                )));
            }

            let mut parsed = Self::parse_sacct(&output.stdout);
            debug!("Return list from sacct ({:?}): {:?}", cluster, parsed);

            for (handle, id) in jobs {
                let state = parsed.remove(id).unwrap_or(NormalizedState::Unknown);
                states.insert(handle.clone(), state);
            }
        }
        Ok(states)
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), CancelError> {
        let (id, cluster) = Self::split_handle(handle);
        let mut args = Vec::with_capacity(3);
        if let Some(cluster) = cluster {
            args.push("-M".to_string());
            args.push(cluster.to_string());
        }
        args.push(id.to_string());
        let command = CommandSpec::new(&self.options.scancel, args);
        debug!("Cancel job {}", handle);

        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| CancelError::rejected(e.to_string()))?;
        if !output.success {
            warn!("scancel {} failed: {}", handle, output.stderr.trim());
            return Err(CancelError::rejected(format!(
                "scancel failed: {}",
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
