//! SQLite adapter for SnapshotStore
//!
//! Every save appends a row; `load_latest` reads the highest sequence.
//! rusqlite is blocking, so each call runs on the blocking pool with the
//! connection behind a mutex.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{SnapshotMeta, SnapshotRecord, SnapshotStore};
use crate::{Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registry_snapshots (
    sequence       INTEGER PRIMARY KEY AUTOINCREMENT,
    format_version INTEGER NOT NULL,
    saved_at       TEXT    NOT NULL,
    size_bytes     INTEGER NOT NULL,
    payload        TEXT    NOT NULL
);
";

pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSnapshotStore {
    /// Open (or create) a database file. The directory must already exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            // rusqlite would silently open a temporary database
            return Err(StorageError::config("database path is empty"));
        }
        if path.is_dir() {
            return Err(StorageError::config(format!(
                "database path {} is a directory",
                path.display()
            )));
        }
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if !dir.is_dir() {
                return Err(StorageError::not_found(format!(
                    "database directory {}",
                    dir.display()
                )));
            }
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::database(format!("SQLite task failed: {}", e)))?
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::serialization(format!("Bad timestamp '{}': {}", raw, e)))
}

fn meta_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, u32, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, record: &SnapshotRecord) -> Result<SnapshotMeta> {
        let payload = serde_json::to_string(&record.payload)?;
        let size_bytes = payload.len();
        let format_version = record.format_version;
        let saved_at = record.saved_at;

        let sequence = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO registry_snapshots (format_version, saved_at, size_bytes, payload)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        format_version,
                        saved_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                        size_bytes as i64,
                        payload
                    ],
                )?;
                let sequence = tx.last_insert_rowid();
                tx.commit()?;
                Ok(sequence)
            })
            .await?;

        Ok(SnapshotMeta {
            sequence: sequence as u64,
            format_version,
            saved_at,
            size_bytes,
        })
    }

    async fn load_latest(&self) -> Result<Option<SnapshotRecord>> {
        let row = self
            .blocking(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT format_version, saved_at, payload FROM registry_snapshots
                         ORDER BY sequence DESC LIMIT 1",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, u32>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()?)
            })
            .await?;

        match row {
            Some((format_version, saved_at, payload)) => Ok(Some(SnapshotRecord {
                format_version,
                saved_at: parse_timestamp(&saved_at)?,
                payload: serde_json::from_str(&payload)?,
            })),
            None => Ok(None),
        }
    }

    async fn list(&self, limit: Option<usize>) -> Result<Vec<SnapshotMeta>> {
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sequence, format_version, saved_at, size_bytes FROM registry_snapshots
                     ORDER BY sequence DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], meta_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(sequence, format_version, saved_at, size_bytes)| {
                Ok(SnapshotMeta {
                    sequence: sequence as u64,
                    format_version,
                    saved_at: parse_timestamp(&saved_at)?,
                    size_bytes: size_bytes as usize,
                })
            })
            .collect()
    }

    async fn prune(&self, keep: usize) -> Result<usize> {
        let keep = keep as i64;
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM registry_snapshots WHERE sequence NOT IN (
                     SELECT sequence FROM registry_snapshots ORDER BY sequence DESC LIMIT ?1
                 )",
                params![keep],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_database() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        assert!(store.load_latest().await.unwrap().is_none());
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_timestamp() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        let record = SnapshotRecord::new(1, json!({"jobs": [{"id": "j1", "attempt_count": 2}]}));

        let meta = store.save(&record).await.unwrap();
        assert_eq!(meta.sequence, 1);

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_history_and_prune() {
        let store = SqliteSnapshotStore::new_in_memory().unwrap();
        for n in 0..4 {
            store.save(&SnapshotRecord::new(1, json!(n))).await.unwrap();
        }

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].sequence, 4);

        assert_eq!(store.prune(1).await.unwrap(), 3);
        assert_eq!(store.list(None).await.unwrap().len(), 1);
        assert_eq!(store.load_latest().await.unwrap().unwrap().payload, json!(3));
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");

        {
            let store = SqliteSnapshotStore::open(&path).unwrap();
            store.save(&SnapshotRecord::new(1, json!("first"))).await.unwrap();
        }

        let reopened = SqliteSnapshotStore::open(&path).unwrap();
        let latest = reopened.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.payload, json!("first"));
    }

    #[test]
    fn test_open_rejects_unusable_paths() {
        let dir = tempfile::tempdir().unwrap();

        let err = SqliteSnapshotStore::open("").err().unwrap();
        assert_eq!(err.kind, ErrorKind::Config);

        let err = SqliteSnapshotStore::open(dir.path()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Config);

        let err = SqliteSnapshotStore::open(dir.path().join("missing/snapshots.db"))
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("missing"));
    }
}
