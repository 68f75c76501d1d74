//! In-memory snapshot store

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{SnapshotMeta, SnapshotRecord, SnapshotStore};
use crate::Result;

struct Stored {
    meta: SnapshotMeta,
    record: SnapshotRecord,
}

/// Keeps every saved record in a vector, oldest first.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    records: Mutex<Vec<Stored>>,
    next_sequence: Mutex<u64>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, record: &SnapshotRecord) -> Result<SnapshotMeta> {
        let size_bytes = record.payload_size()?;
        let sequence = {
            let mut next = self.next_sequence.lock();
            *next += 1;
            *next
        };

        let meta = SnapshotMeta {
            sequence,
            format_version: record.format_version,
            saved_at: record.saved_at,
            size_bytes,
        };
        self.records.lock().push(Stored {
            meta: meta.clone(),
            record: record.clone(),
        });
        Ok(meta)
    }

    async fn load_latest(&self) -> Result<Option<SnapshotRecord>> {
        Ok(self.records.lock().last().map(|s| s.record.clone()))
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<SnapshotMeta>> {
        let records = self.records.lock();
        let newest_first = records.iter().rev().map(|s| s.meta.clone());
        Ok(match limit {
            Some(n) => newest_first.take(n).collect(),
            None => newest_first.collect(),
        })
    }

    async fn prune(&self, keep: usize) -> Result<usize> {
        let mut records = self.records.lock();
        let excess = records.len().saturating_sub(keep);
        records.drain(..excess);
        Ok(excess)
    }
}
