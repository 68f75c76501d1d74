//! Retry / resubmission policy.
//!
//! The policy is plain data; `decide` is a pure function of the policy and a
//! failed job record. Scheduling the decision (delays, clock) is the
//! orchestrator's business.

use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::job::{BackendKind, FailureReason, Job, JobState};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before a same-backend resubmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Backoff {
    pub fn none() -> Self {
        Backoff::Fixed { delay_ms: 0 }
    }

    /// Delay after the `attempt`-th failed attempt on a backend (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let scaled = *initial_ms as f64 * multiplier.powi(exponent);
                let capped = if scaled.is_finite() {
                    scaled.min(*max_ms as f64)
                } else {
                    *max_ms as f64
                };
                Duration::from_millis(capped as u64)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 5_000,
            multiplier: 2.0,
            max_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Cap on attempts per backend
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Backends to try, in order, once the current one is exhausted
    pub fallback_backend_order: Vec<BackendKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            fallback_backend_order: Vec::new(),
        }
    }
}

/// Outcome of evaluating the policy for a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Resubmit {
        backend: BackendKind,
        delay: Duration,
        /// Backend fallback: the per-backend attempt counter starts over
        fresh_counter: bool,
    },
    GiveUp {
        reason: String,
    },
}

impl RetryDecision {
    /// History note recording the decision
    pub fn note(&self) -> String {
        match self {
            RetryDecision::Resubmit {
                backend,
                delay,
                fresh_counter: true,
            } => format!("retry policy: fall back to {} after {:?}", backend, delay),
            RetryDecision::Resubmit { backend, delay, .. } => {
                format!("retry policy: resubmit on {} after {:?}", backend, delay)
            }
            RetryDecision::GiveUp { reason } => format!("retry policy: give up ({})", reason),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            fallback_backend_order: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, order: impl IntoIterator<Item = BackendKind>) -> Self {
        self.fallback_backend_order = order.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(OrchestratorError::config("max_attempts must be at least 1"));
        }
        if let Backoff::Exponential {
            initial_ms,
            multiplier,
            max_ms,
        } = &self.backoff
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(OrchestratorError::config(
                    "exponential backoff multiplier must be >= 1.0",
                ));
            }
            if max_ms < initial_ms {
                return Err(OrchestratorError::config(
                    "exponential backoff max_ms must be >= initial_ms",
                ));
            }
        }
        for (i, kind) in self.fallback_backend_order.iter().enumerate() {
            if self.fallback_backend_order[..i].contains(kind) {
                return Err(OrchestratorError::config(format!(
                    "backend {} listed twice in fallback_backend_order",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Decide what happens to a job that just reached `Failed` or `SubmissionFailed`
    pub fn decide(&self, job: &Job) -> RetryDecision {
        let skip_same_backend = match &job.state {
            JobState::SubmissionFailed { category, .. } => *category != ErrorCategory::Transient,
            JobState::Failed { .. } => false,
            other => {
                return RetryDecision::GiveUp {
                    reason: format!("{} is not a retryable state", other),
                }
            }
        };

        if !skip_same_backend && job.attempt_count < self.max_attempts {
            return RetryDecision::Resubmit {
                backend: job.backend_kind,
                delay: self.backoff.delay(job.attempt_count),
                fresh_counter: false,
            };
        }

        let fallback = self
            .fallback_backend_order
            .iter()
            .copied()
            .find(|kind| *kind != job.backend_kind && !job.backends_tried.contains(kind));
        if let Some(backend) = fallback {
            return RetryDecision::Resubmit {
                backend,
                delay: Duration::ZERO,
                fresh_counter: true,
            };
        }

        let reason = match &job.state {
            JobState::SubmissionFailed { category, .. } if skip_same_backend => format!(
                "{} submission error on {} and no unused fallback backend",
                category, job.backend_kind
            ),
            JobState::Failed {
                reason: FailureReason::LostTrack { .. },
            } => format!(
                "lost track on {} after {} attempt(s), no unused fallback backend",
                job.backend_kind, job.attempt_count
            ),
            _ => format!(
                "{} attempt(s) exhausted on {}, no unused fallback backend",
                job.attempt_count, job.backend_kind
            ),
        };
        RetryDecision::GiveUp { reason }
    }
}
