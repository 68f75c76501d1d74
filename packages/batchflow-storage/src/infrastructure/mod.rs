//! Infrastructure layer - Storage adapters
//!
//! - memory: process-local, for tests
//! - file: single JSON document with atomic replace
//! - sqlite: snapshot history table

pub mod file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileSnapshotStore;
pub use memory::InMemorySnapshotStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSnapshotStore;
