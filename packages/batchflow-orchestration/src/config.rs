//! Engine configuration (YAML)
//!
//! ```yaml
//! version: 1
//! default_backend: slurm
//! enabled_backends: [slurm, local]
//! poller:
//!   interval_ms: 30000
//!   lost_track_grace_polls: 5
//! retry:
//!   max_attempts: 3
//!   backoff: { kind: exponential, initial_ms: 5000, multiplier: 2.0, max_ms: 300000 }
//!   fallback_backend_order: [local]
//! default_resources:
//!   partition: short
//!   memory: 4G
//! persist_interval_ms: 60000
//! snapshot_retention: 10
//! ```
//!
//! Every section is optional; missing fields take their defaults.

use crate::backend::{
    BackendSet, HTCondorBackend, HTCondorOptions, LocalBackend, SlurmBackend, SlurmOptions,
    SystemCommandRunner,
};
use crate::error::{OrchestratorError, Result};
use crate::job::{BackendKind, ResourceRequest};
use crate::poller::PollerConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,
    pub default_backend: BackendKind,
    /// Adapters to register when building a `BackendSet` from this config
    pub enabled_backends: Vec<BackendKind>,
    pub poller: PollerConfig,
    pub retry: RetryPolicy,
    /// Merged under each job's own resource request
    pub default_resources: ResourceRequest,
    /// Periodic registry snapshots; `None` disables them
    pub persist_interval_ms: Option<u64>,
    /// Snapshots kept in the store after each persist
    pub snapshot_retention: usize,
    /// Timeout for one scheduler CLI call
    pub command_timeout_secs: u64,
    pub slurm: SlurmOptions,
    pub htcondor: HTCondorOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            default_backend: BackendKind::Local,
            enabled_backends: vec![BackendKind::Local],
            poller: PollerConfig::default(),
            retry: RetryPolicy::default(),
            default_resources: ResourceRequest::default(),
            persist_interval_ms: None,
            snapshot_retention: 10,
            command_timeout_secs: 60,
            slurm: SlurmOptions::default(),
            htcondor: HTCondorOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(OrchestratorError::config(format!(
                "unsupported config version {} (supported: {})",
                self.version, CONFIG_VERSION
            )));
        }
        self.poller.validate()?;
        self.retry.validate()?;
        self.default_resources.validate()?;

        if self.enabled_backends.is_empty() {
            return Err(OrchestratorError::config("no backend enabled"));
        }
        if !self.enabled_backends.contains(&self.default_backend) {
            return Err(OrchestratorError::config(format!(
                "default backend {} is not enabled",
                self.default_backend
            )));
        }
        if let Some(missing) = self
            .retry
            .fallback_backend_order
            .iter()
            .find(|kind| !self.enabled_backends.contains(kind))
        {
            return Err(OrchestratorError::config(format!(
                "fallback backend {} is not enabled",
                missing
            )));
        }
        if self.persist_interval_ms == Some(0) {
            return Err(OrchestratorError::config(
                "persist_interval_ms must be positive when set",
            ));
        }
        if self.snapshot_retention == 0 {
            return Err(OrchestratorError::config("snapshot_retention must be at least 1"));
        }
        if self.command_timeout_secs == 0 {
            return Err(OrchestratorError::config("command_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn persist_interval(&self) -> Option<Duration> {
        self.persist_interval_ms.map(Duration::from_millis)
    }

    /// Adapters for the enabled backends, talking to the real scheduler CLIs
    pub fn build_backends(&self) -> BackendSet {
        let runner = Arc::new(SystemCommandRunner::new(Duration::from_secs(
            self.command_timeout_secs,
        )));
        let mut backends = BackendSet::new();
        for kind in &self.enabled_backends {
            match kind {
                BackendKind::Slurm => backends.register(Arc::new(SlurmBackend::new(
                    runner.clone(),
                    self.slurm.clone(),
                ))),
                BackendKind::HTCondor => backends.register(Arc::new(HTCondorBackend::new(
                    runner.clone(),
                    self.htcondor.clone(),
                ))),
                BackendKind::Local => backends.register(Arc::new(LocalBackend::new())),
            }
        }
        backends
    }
}
