//! Domain layer for registry snapshots
//!
//! # Domain Models
//!
//! - `SnapshotRecord`: one saved document (format version, timestamp, payload)
//! - `SnapshotMeta`: what a store reports about a record it holds
//!
//! # Port Trait
//!
//! - `SnapshotStore`: save / load latest / list / prune
//!
//! # Examples
//!
//! ```rust,ignore
//! use batchflow_storage::domain::{SnapshotRecord, SnapshotStore};
//!
//! async fn example(store: impl SnapshotStore) -> Result<()> {
//!     let meta = store.save(&SnapshotRecord::new(1, serde_json::json!({"jobs": []}))).await?;
//!     let latest = store.load_latest().await?.expect("just saved");
//!     assert_eq!(latest.format_version, 1);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// A saved snapshot document.
///
/// The payload is opaque to the store. `format_version` lets the writer evolve
/// its own schema and refuse documents it does not understand on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Payload schema version chosen by the writer
    pub format_version: u32,
    /// When the writer produced the snapshot
    pub saved_at: DateTime<Utc>,
    /// The snapshot document itself
    pub payload: serde_json::Value,
}

impl SnapshotRecord {
    /// Create a record stamped with the current time
    pub fn new(format_version: u32, payload: serde_json::Value) -> Self {
        Self {
            format_version,
            saved_at: Utc::now(),
            payload,
        }
    }

    /// Create a record with an explicit timestamp
    pub fn at(format_version: u32, saved_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            format_version,
            saved_at,
            payload,
        }
    }

    /// Encoded size of the payload in bytes (JSON)
    pub fn payload_size(&self) -> Result<usize> {
        Ok(serde_json::to_vec(&self.payload)?.len())
    }
}

/// Metadata about a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Store-assigned, strictly increasing sequence number
    pub sequence: u64,
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub size_bytes: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Durable snapshot storage.
///
/// Implementations must be safe to share between the periodic snapshot task
/// and on-demand callers; each `save` is atomic with respect to `load_latest`
/// (a reader sees either the previous record or the new one, never a torn one).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a new record and return its metadata.
    async fn save(&self, record: &SnapshotRecord) -> Result<SnapshotMeta>;

    /// Most recently saved record, or `None` for an empty store.
    async fn load_latest(&self) -> Result<Option<SnapshotRecord>>;

    /// Metadata of stored records, newest first.
    async fn list(&self, limit: Option<usize>) -> Result<Vec<SnapshotMeta>>;

    /// Drop all but the newest `keep` records. Returns how many were removed.
    async fn prune(&self, keep: usize) -> Result<usize>;
}
