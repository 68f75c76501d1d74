//! JSON file snapshot store
//!
//! Holds only the latest record. Saves go to a sibling `.tmp` file which is
//! then renamed over the target, so a crash mid-write leaves the previous
//! snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{SnapshotMeta, SnapshotRecord, SnapshotStore};
use crate::{Result, StorageError};

#[derive(Serialize, Deserialize)]
struct FileEnvelope {
    sequence: u64,
    record: SnapshotRecord,
}

pub struct FileSnapshotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn read_envelope(&self) -> Result<Option<FileEnvelope>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, record: &SnapshotRecord) -> Result<SnapshotMeta> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let sequence = self
            .read_envelope()
            .await?
            .map(|env| env.sequence + 1)
            .unwrap_or(1);

        let envelope = FileEnvelope {
            sequence,
            record: record.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            "Wrote snapshot #{} to {} ({} bytes)",
            sequence,
            self.path.display(),
            bytes.len()
        );

        Ok(SnapshotMeta {
            sequence,
            format_version: record.format_version,
            saved_at: record.saved_at,
            size_bytes: record.payload_size()?,
        })
    }

    async fn load_latest(&self) -> Result<Option<SnapshotRecord>> {
        Ok(self.read_envelope().await?.map(|env| env.record))
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<SnapshotMeta>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        match self.read_envelope().await? {
            Some(env) => Ok(vec![SnapshotMeta {
                sequence: env.sequence,
                format_version: env.record.format_version,
                saved_at: env.record.saved_at,
                size_bytes: env.record.payload_size()?,
            }]),
            None => Ok(Vec::new()),
        }
    }

    async fn prune(&self, keep: usize) -> Result<usize> {
        if keep > 0 {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::io(format!(
                "Failed to remove {}: {}",
                self.path.display(),
                e
            ))
            .with_source(e)),
        }
    }
}
