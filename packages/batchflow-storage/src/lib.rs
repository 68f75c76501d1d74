//! batchflow-storage - durable snapshots for the job registry
//!
//! > "Snapshot on demand, reload on start, lose nothing in between."
//!
//! ## Core Principles
//!
//! 1. **Opaque payloads**: the store never interprets job records, it keeps
//!    whatever JSON document the registry hands it
//! 2. **Append, then read latest**: every save creates a new record; reload
//!    always picks the most recent one
//! 3. **Lossless round-trip**: what goes in comes back byte-for-byte equal as JSON
//!
//! ## Adapters
//!
//! - `InMemorySnapshotStore`: tests and short-lived processes
//! - `FileSnapshotStore`: one JSON file, replaced atomically on every save
//! - `SqliteSnapshotStore`: snapshot history in a SQLite table (feature `sqlite`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use batchflow_storage::{FileSnapshotStore, SnapshotRecord, SnapshotStore};
//!
//! let store = FileSnapshotStore::new("/var/lib/batchflow/registry.json");
//! store.save(&SnapshotRecord::new(1, payload)).await?;
//!
//! if let Some(latest) = store.load_latest().await? {
//!     // hand latest.payload back to the registry
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{SnapshotMeta, SnapshotRecord, SnapshotStore};
pub use infrastructure::{FileSnapshotStore, InMemorySnapshotStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteSnapshotStore;
