use crate::backend::NormalizedState;
use crate::error::{ErrorCategory, OrchestratorError, Result, SubmissionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Stable job identifier, unique for the lifetime of a registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Execution backend selector
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Slurm,
    #[serde(rename = "htcondor")]
    HTCondor,
    #[default]
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Slurm => "slurm",
            BackendKind::HTCondor => "htcondor",
            BackendKind::Local => "local",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "slurm" => Ok(BackendKind::Slurm),
            "htcondor" | "condor" => Ok(BackendKind::HTCondor),
            "local" => Ok(BackendKind::Local),
            _ => Err(OrchestratorError::config(format!("Unknown backend: {}", s))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to execute. Content is owned by whoever generated the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptRef {
    /// Executable script on a filesystem the backend can see
    Path(PathBuf),
    /// Shell command line, run through `sh -c`
    Inline(String),
}

/// Resource request handed to the backend as-is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub cores: Option<u32>,
    /// Memory with optional unit suffix (K/M/G/T), e.g. "4G"
    pub memory: Option<String>,
    /// Wall time in scheduler notation, e.g. "02:00:00" or "1-12:00:00"
    pub wall_time: Option<String>,
    /// Queue / partition name
    pub partition: Option<String>,
    pub qos: Option<String>,
    /// Nodes to exclude
    pub exclude: Option<String>,
    pub clusters: Option<String>,
    /// Environment export specification
    pub export: Option<String>,
    /// Backend-specific passthrough options
    pub extra: BTreeMap<String, String>,
}

impl ResourceRequest {
    /// Fill unset fields from `defaults`; explicit values win
    pub fn with_defaults(mut self, defaults: &ResourceRequest) -> Self {
        fn fill<T: Clone>(field: &mut Option<T>, default: &Option<T>) {
            if field.is_none() {
                field.clone_from(default);
            }
        }
        fill(&mut self.cores, &defaults.cores);
        fill(&mut self.memory, &defaults.memory);
        fill(&mut self.wall_time, &defaults.wall_time);
        fill(&mut self.partition, &defaults.partition);
        fill(&mut self.qos, &defaults.qos);
        fill(&mut self.exclude, &defaults.exclude);
        fill(&mut self.clusters, &defaults.clusters);
        fill(&mut self.export, &defaults.export);
        for (key, value) in &defaults.extra {
            self.extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cores == Some(0) {
            return Err(OrchestratorError::config("cores must be at least 1"));
        }

        if let Some(memory) = &self.memory {
            let digits = memory.trim_end_matches(|c: char| "KMGTkmgt".contains(c));
            if digits.is_empty()
                || !digits.chars().all(|c| c.is_ascii_digit())
                || memory.len() - digits.len() > 1
            {
                return Err(OrchestratorError::config(format!(
                    "invalid memory request '{}' (expected e.g. 512M or 4G)",
                    memory
                )));
            }
        }

        if let Some(wall_time) = &self.wall_time {
            let well_formed = !wall_time.is_empty()
                && wall_time
                    .chars()
                    .all(|c| c.is_ascii_digit() || c == ':' || c == '-')
                && wall_time.chars().next().map_or(false, |c| c.is_ascii_digit());
            if !well_formed {
                return Err(OrchestratorError::config(format!(
                    "invalid wall time '{}' (expected e.g. 02:00:00)",
                    wall_time
                )));
            }
        }

        for (field, value) in [
            ("partition", &self.partition),
            ("qos", &self.qos),
            ("exclude", &self.exclude),
            ("clusters", &self.clusters),
        ] {
            if let Some(v) = value {
                if v.trim().is_empty() || v.chars().any(char::is_whitespace) {
                    return Err(OrchestratorError::config(format!(
                        "{} must be a non-empty name without whitespace",
                        field
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Caller-side description of a job to define
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: Option<JobId>,
    pub name: Option<String>,
    pub script: ScriptRef,
    #[serde(default)]
    pub run_args: Vec<String>,
    /// `None` runs the job on the engine's default backend
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Where the backend should write stdout/stderr
    pub log: Option<PathBuf>,
}

impl JobSpec {
    pub fn new(script: ScriptRef, backend: BackendKind) -> Self {
        Self {
            backend: Some(backend),
            ..Self::from_script(script)
        }
    }

    /// Spec with no backend of its own
    pub fn from_script(script: ScriptRef) -> Self {
        Self {
            id: None,
            name: None,
            script,
            run_args: Vec::new(),
            backend: None,
            resources: ResourceRequest::default(),
            log: None,
        }
    }

    pub fn inline(command: impl Into<String>, backend: BackendKind) -> Self {
        Self::new(ScriptRef::Inline(command.into()), backend)
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = Some(log.into());
        self
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend-assigned identifier (cluster job id, process id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(String);

impl BackendHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a job that reached its backend ended up failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend reported a failure (non-zero exit, timeout, node failure...)
    Backend { detail: Option<String> },
    /// The backend stopped reporting usable status for too long
    LostTrack { observations: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Backend { detail: Some(d) } => write!(f, "backend reported failure: {}", d),
            FailureReason::Backend { detail: None } => write!(f, "backend reported failure"),
            FailureReason::LostTrack { observations } => {
                write!(f, "lost track after {} unusable status observations", observations)
            }
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobState {
    Defined,
    Submitting,
    Pending,
    Running,
    Succeeded,
    Failed {
        reason: FailureReason,
    },
    Cancelled,
    SubmissionFailed {
        error: String,
        category: ErrorCategory,
    },
}

impl JobState {
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Defined => "defined",
            JobState::Submitting => "submitting",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled => "cancelled",
            JobState::SubmissionFailed { .. } => "submission_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded
                | JobState::Failed { .. }
                | JobState::Cancelled
                | JobState::SubmissionFailed { .. }
        )
    }

    /// Submitted and not yet finished: the poller's working set
    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }

    /// Failure states the retry policy is consulted for
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, JobState::Failed { .. } | JobState::SubmissionFailed { .. })
    }

    fn same_variant(&self, other: &JobState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Whether `from → to` is an edge of the lifecycle graph
pub fn can_transition(from: &JobState, to: &JobState) -> bool {
    use JobState::*;
    matches!(
        (from, to),
        (Defined, Submitting)
            | (Defined, Cancelled)
            | (Submitting, Pending)
            | (Submitting, SubmissionFailed { .. })
            | (Submitting, Cancelled)
            | (Pending, Running)
            | (Pending, Succeeded)
            | (Pending, Failed { .. })
            | (Pending, Cancelled)
            | (Running, Succeeded)
            | (Running, Failed { .. })
            | (Running, Cancelled)
            | (Failed { .. }, Defined)
            | (SubmissionFailed { .. }, Defined)
            | (Cancelled, Defined)
            | (Failed { .. }, Cancelled)
            | (SubmissionFailed { .. }, Cancelled)
    )
}

/// One line of a job's audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// Attempt number across all backends (0 before the first submission)
    pub attempt: u32,
    pub backend: BackendKind,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<BackendHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A resubmission decided by the retry policy, waiting for its delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRetry {
    pub due_at: DateTime<Utc>,
    pub backend: BackendKind,
    /// Start a fresh per-backend attempt counter (backend fallback)
    pub fresh_counter: bool,
}

/// Job model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub script: ScriptRef,
    #[serde(default)]
    pub run_args: Vec<String>,
    pub log: Option<PathBuf>,
    pub backend_kind: BackendKind,
    pub resources: ResourceRequest,
    pub state: JobState,
    pub backend_handle: Option<BackendHandle>,
    /// Attempts on the current backend
    pub attempt_count: u32,
    /// Attempts across all backends
    pub total_attempts: u32,
    /// Backends this job has been submitted to, in order
    #[serde(default)]
    pub backends_tried: Vec<BackendKind>,
    pub history: Vec<HistoryEntry>,
    /// Consecutive polls without a usable status
    #[serde(default)]
    pub unknown_streak: u32,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub scheduled_retry: Option<ScheduledRetry>,
    /// The retry policy gave up on this job
    #[serde(default)]
    pub retry_exhausted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job in `Defined` from a spec. A spec without a backend runs locally.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Self {
        let id = spec.id.unwrap_or_else(JobId::generate);
        let name = spec.name.unwrap_or_else(|| id.to_string());
        let backend = spec.backend.unwrap_or_default();
        Self {
            history: vec![HistoryEntry {
                at: now,
                attempt: 0,
                backend,
                state: JobState::Defined,
                handle: None,
                note: Some("defined".to_string()),
            }],
            id,
            name,
            script: spec.script,
            run_args: spec.run_args,
            log: spec.log,
            backend_kind: backend,
            resources: spec.resources,
            state: JobState::Defined,
            backend_handle: None,
            attempt_count: 0,
            total_attempts: 0,
            backends_tried: Vec::new(),
            unknown_streak: 0,
            cancel_requested: false,
            scheduled_retry: None,
            retry_exhausted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the record-level invariants
    pub fn check_invariants(&self) -> Result<()> {
        let violation =
            |msg: String| -> Result<()> { Err(OrchestratorError::Other(anyhow::anyhow!(msg))) };

        let handle_required = match &self.state {
            JobState::Defined | JobState::Submitting | JobState::SubmissionFailed { .. } => {
                Some(false)
            }
            JobState::Pending | JobState::Running | JobState::Succeeded | JobState::Failed { .. } => {
                Some(true)
            }
            JobState::Cancelled => None,
        };
        if let Some(required) = handle_required {
            if required != self.backend_handle.is_some() {
                return violation(format!(
                    "job {}: handle presence {} does not match state {}",
                    self.id,
                    self.backend_handle.is_some(),
                    self.state
                ));
            }
        }

        if self.backend_handle.is_some() && self.attempt_count == 0 {
            return violation(format!("job {}: handle set with zero attempts", self.id));
        }

        if self.history.windows(2).any(|w| w[1].at < w[0].at) {
            return violation(format!("job {}: history timestamps go backwards", self.id));
        }

        match self.history.last() {
            Some(last) if last.state == self.state => Ok(()),
            _ => violation(format!(
                "job {}: last history entry does not match state {}",
                self.id, self.state
            )),
        }
    }

    /// Terminal with nothing further planned: no automatic resubmission will follow
    pub fn is_settled(&self) -> bool {
        match &self.state {
            JobState::Succeeded | JobState::Cancelled => true,
            JobState::Failed { .. } | JobState::SubmissionFailed { .. } => self.retry_exhausted,
            _ => false,
        }
    }

    /// Id of the job in log lines: `name (id)` unless they coincide
    pub fn label(&self) -> String {
        if self.name == self.id.as_str() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.id)
        }
    }
}

/// What a status observation did to a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// State unchanged (still pending/running, or the job was not outstanding)
    Unchanged,
    /// Status was unusable; the streak grew but is within grace
    Unusable { streak: u32 },
    /// A transition was committed
    Transitioned { from: JobState, to: JobState },
}

/// Job state machine: validated transitions on a borrowed job record
pub struct JobStateMachine<'a> {
    job: &'a mut Job,
    now: DateTime<Utc>,
}

impl<'a> JobStateMachine<'a> {
    pub fn new(job: &'a mut Job, now: DateTime<Utc>) -> Self {
        Self { job, now }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    /// Timestamp for the next history entry, never before the previous one
    fn stamp(&self) -> DateTime<Utc> {
        match self.job.history.last() {
            Some(last) if last.at > self.now => last.at,
            _ => self.now,
        }
    }

    fn push_entry(&mut self, note: Option<String>) {
        let entry = HistoryEntry {
            at: self.stamp(),
            attempt: self.job.total_attempts,
            backend: self.job.backend_kind,
            state: self.job.state.clone(),
            handle: self.job.backend_handle.clone(),
            note,
        };
        self.job.updated_at = entry.at;
        self.job.history.push(entry);
    }

    fn transition(&mut self, to: JobState, note: Option<String>) -> Result<JobState> {
        if !can_transition(&self.job.state, &to) {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                to.state_name(),
            ));
        }
        let from = std::mem::replace(&mut self.job.state, to);
        self.push_entry(note);
        Ok(from)
    }

    /// Same-state history entry recording a decision
    pub fn annotate(&mut self, note: impl Into<String>) {
        self.push_entry(Some(note.into()));
    }

    /// Transition: DEFINED → SUBMITTING (one attempt begins)
    pub fn begin_submission(&mut self) -> Result<()> {
        if !matches!(self.job.state, JobState::Defined) {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "submitting",
            ));
        }
        self.job.attempt_count += 1;
        self.job.total_attempts += 1;
        if !self.job.backends_tried.contains(&self.job.backend_kind) {
            self.job.backends_tried.push(self.job.backend_kind);
        }
        let note = format!(
            "attempt {} on {}",
            self.job.attempt_count, self.job.backend_kind
        );
        self.transition(JobState::Submitting, Some(note))?;
        Ok(())
    }

    /// Transition: SUBMITTING → PENDING
    pub fn submission_succeeded(&mut self, handle: BackendHandle) -> Result<()> {
        if !matches!(self.job.state, JobState::Submitting) {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "pending",
            ));
        }
        self.job.backend_handle = Some(handle);
        self.job.unknown_streak = 0;
        self.transition(JobState::Pending, None)?;
        Ok(())
    }

    /// Transition: SUBMITTING → SUBMISSION_FAILED
    pub fn submission_failed(&mut self, error: &SubmissionError) -> Result<()> {
        self.transition(
            JobState::SubmissionFailed {
                error: error.message.clone(),
                category: error.category,
            },
            None,
        )?;
        Ok(())
    }

    /// Apply a backend-reported status to an outstanding job.
    ///
    /// `lost_track_grace` is the number of consecutive unusable observations
    /// tolerated; the next one fails the job with `LostTrack`.
    pub fn observe(
        &mut self,
        observed: &NormalizedState,
        lost_track_grace: u32,
    ) -> Result<Observation> {
        if !self.job.state.is_outstanding() {
            return Ok(Observation::Unchanged);
        }

        let target = match observed {
            NormalizedState::Unknown => return self.unusable(lost_track_grace),
            NormalizedState::Pending => None,
            NormalizedState::Running => match self.job.state {
                JobState::Pending => Some(JobState::Running),
                _ => None,
            },
            NormalizedState::Succeeded => Some(JobState::Succeeded),
            NormalizedState::Failed { detail } => Some(JobState::Failed {
                reason: FailureReason::Backend {
                    detail: detail.clone(),
                },
            }),
            NormalizedState::Cancelled => Some(JobState::Cancelled),
        };

        self.job.unknown_streak = 0;
        match target {
            Some(to) => {
                let from = self.transition(to.clone(), None)?;
                Ok(Observation::Transitioned { from, to })
            }
            None => Ok(Observation::Unchanged),
        }
    }

    /// Count a poll that produced no usable status (Unknown or query error)
    pub fn unusable(&mut self, lost_track_grace: u32) -> Result<Observation> {
        if !self.job.state.is_outstanding() {
            return Ok(Observation::Unchanged);
        }
        self.job.unknown_streak += 1;
        let streak = self.job.unknown_streak;
        if streak <= lost_track_grace {
            return Ok(Observation::Unusable { streak });
        }

        let to = JobState::Failed {
            reason: FailureReason::LostTrack {
                observations: streak,
            },
        };
        let from = self.transition(to.clone(), None)?;
        Ok(Observation::Transitioned { from, to })
    }

    /// Record cancellation intent without touching the state
    pub fn request_cancel(&mut self) {
        if !self.job.cancel_requested {
            self.job.cancel_requested = true;
            self.annotate("cancel requested");
        }
    }

    /// Transition: DEFINED/SUBMITTING → CANCELLED, before anything reached the backend
    pub fn cancel_unsubmitted(&mut self, note: &str) -> Result<()> {
        if !matches!(self.job.state, JobState::Defined | JobState::Submitting) {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "cancelled",
            ));
        }
        self.job.cancel_requested = true;
        self.transition(JobState::Cancelled, Some(note.to_string()))?;
        Ok(())
    }

    /// Transition: PENDING/RUNNING → CANCELLED after the backend acknowledged
    pub fn cancel_confirmed(&mut self) -> Result<()> {
        if !self.job.state.is_outstanding() {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "cancelled",
            ));
        }
        self.job.cancel_requested = true;
        self.transition(JobState::Cancelled, Some("cancel acknowledged".to_string()))?;
        Ok(())
    }

    /// Transition: FAILED/SUBMISSION_FAILED → CANCELLED, dropping a scheduled resubmission
    pub fn abort_scheduled_retry(&mut self) -> Result<()> {
        if self.job.scheduled_retry.is_none() {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "cancelled",
            ));
        }
        self.cancel_after_failure("scheduled resubmission cancelled")
    }

    /// Transition: FAILED/SUBMISSION_FAILED → CANCELLED for a job whose cancellation
    /// was requested before the failure was seen
    pub fn cancel_after_failure(&mut self, note: &str) -> Result<()> {
        if !self.job.state.is_retryable_failure() {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "cancelled",
            ));
        }
        self.job.scheduled_retry = None;
        self.job.cancel_requested = true;
        self.transition(JobState::Cancelled, Some(note.to_string()))?;
        Ok(())
    }

    /// Record a resubmission decision
    pub fn schedule_retry(&mut self, retry: ScheduledRetry, note: impl Into<String>) {
        self.job.scheduled_retry = Some(retry);
        self.annotate(note);
    }

    /// Record that no further automatic attempt will be made
    pub fn give_up(&mut self, note: impl Into<String>) {
        self.job.scheduled_retry = None;
        self.job.retry_exhausted = true;
        self.annotate(note);
    }

    /// Transition: terminal → DEFINED, a fresh attempt record
    pub fn reset_for_attempt(
        &mut self,
        backend: BackendKind,
        fresh_counter: bool,
        note: impl Into<String>,
    ) -> Result<()> {
        if !can_transition(&self.job.state, &JobState::Defined) {
            return Err(OrchestratorError::invalid_transition(
                self.job.state.state_name(),
                "defined",
            ));
        }
        self.job.backend_handle = None;
        self.job.backend_kind = backend;
        if fresh_counter {
            self.job.attempt_count = 0;
        }
        self.job.unknown_streak = 0;
        self.job.cancel_requested = false;
        self.job.scheduled_retry = None;
        self.job.retry_exhausted = false;
        self.transition(JobState::Defined, Some(note.into()))?;
        Ok(())
    }

    /// Transition: SUBMITTING → SUBMISSION_FAILED for a submission cut short by a restart
    pub fn mark_interrupted(&mut self) -> Result<()> {
        self.submission_failed(&SubmissionError::transient("interrupted during submission"))
    }

    /// Rebuild the state a history leads to, validating every step.
    ///
    /// Entries that repeat the current state are annotations.
    pub fn replay(history: &[HistoryEntry]) -> Result<JobState> {
        let mut entries = history.iter();
        let mut current = match entries.next() {
            Some(first) if first.state == JobState::Defined => JobState::Defined,
            Some(first) => {
                return Err(OrchestratorError::invalid_transition(
                    "(none)",
                    first.state.state_name(),
                ))
            }
            None => {
                return Err(OrchestratorError::serialization("empty job history"));
            }
        };

        for entry in entries {
            if entry.state == current {
                continue;
            }
            if current.same_variant(&entry.state) || !can_transition(&current, &entry.state) {
                return Err(OrchestratorError::invalid_transition(
                    current.state_name(),
                    entry.state.state_name(),
                ));
            }
            current = entry.state.clone();
        }
        Ok(current)
    }
}
