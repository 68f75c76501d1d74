use crate::job::{BackendKind, JobId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Cancel error: {0}")]
    Cancel(#[from] CancelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job already registered: {0}")]
    DuplicateJob(JobId),

    #[error("Timed out waiting for job {0} to settle")]
    WaitTimeout(JobId),

    #[error("No adapter registered for backend {0}")]
    BackendNotRegistered(BackendKind),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] batchflow_storage::StorageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry on the same backend (e.g., invalid request)
    Permanent,
    /// Infrastructure error - alert ops (e.g., scheduler binary missing)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The backend rejected a job or could not accept it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({category})")]
pub struct SubmissionError {
    pub message: String,
    pub category: ErrorCategory,
}

impl SubmissionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Infrastructure,
        }
    }

    /// Spawn/IO failures: a missing scheduler binary is not going to fix itself
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::infrastructure(err.to_string())
            }
            _ => Self::transient(err.to_string()),
        }
    }
}

/// Communication with a backend failed. Never changes job state by itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct QueryError {
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for QueryError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Why a cancellation could not be confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelFailure {
    /// The cancel command ran but a follow-up status query did not confirm it
    Unverifiable,
    /// The backend refused or failed to run the cancel command
    Rejected,
}

impl std::fmt::Display for CancelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelFailure::Unverifiable => write!(f, "unverifiable"),
            CancelFailure::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}: {message}")]
pub struct CancelError {
    pub reason: CancelFailure,
    pub message: String,
}

impl CancelError {
    pub fn unverifiable(message: impl Into<String>) -> Self {
        Self {
            reason: CancelFailure::Unverifiable,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            reason: CancelFailure::Rejected,
            message: message.into(),
        }
    }
}
