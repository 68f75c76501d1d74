/*
 * Batchflow Orchestration - Job Lifecycle Engine
 *
 * Submits, tracks and reconciles computational jobs across cluster batch
 * schedulers and local processes behind one job abstraction.
 *
 * Architecture:
 * - Job State Machine (validated transitions, replayable history)
 * - Backend Adapters (Slurm, HTCondor, local processes)
 * - Status Poller (batched queries, LostTrack detection)
 * - Retry Policy (backoff, backend fallback)
 * - Job Registry (per-job atomic updates, snapshots, notifications)
 */

// Public modules
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod job;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod telemetry;

// Re-exports
pub use backend::{
    BackendAdapter, BackendSet, CommandOutput, CommandRunner, CommandSpec, HTCondorBackend,
    HTCondorOptions, LocalBackend, NormalizedState, SlurmBackend, SlurmOptions, SubmitRequest,
    SystemCommandRunner,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{
    CancelError, CancelFailure, ErrorCategory, OrchestratorError, QueryError, Result,
    SubmissionError,
};
pub use job::{
    BackendHandle, BackendKind, FailureReason, HistoryEntry, Job, JobId, JobSpec, JobState,
    JobStateMachine, ResourceRequest, ScriptRef,
};
#[cfg(feature = "metrics")]
pub use metrics::EngineMetrics;
pub use orchestrator::{CancelOutcome, JobOrchestrator};
pub use poller::{PollReport, PollerConfig, StatusPoller};
pub use registry::{JobEvent, JobRegistry, RegistrySnapshot};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use telemetry::init_tracing;
