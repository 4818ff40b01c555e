//! Persistent transfer history.
//!
//! Records are loaded into memory once when the store is opened. `put` only
//! buffers; `flush` appends everything buffered in a single transaction.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_rusqlite::{Connection, params, rusqlite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::EngineError;
use crate::core::models::{ContentHash, MediaEntry, TransferCounts};

/// How a source file is recognised across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceIdentity {
    Content(ContentHash),
    /// Fallback when the file could not be hashed.
    Stat {
        relative_path: PathBuf,
        size: u64,
        mtime_nanos: i64,
    },
}

impl SourceIdentity {
    pub fn for_entry(entry: &MediaEntry, digest: Option<&ContentHash>) -> Self {
        match digest {
            Some(hash) => Self::Content(hash.clone()),
            None => Self::Stat {
                relative_path: entry.relative_path.clone(),
                size: entry.size_bytes,
                mtime_nanos: entry.modified.timestamp_nanos_opt().unwrap_or_default(),
            },
        }
    }

    pub fn key(&self) -> String {
        match self {
            Self::Content(hash) => format!("blake3:{hash}"),
            Self::Stat {
                relative_path,
                size,
                mtime_nanos,
            } => format!("stat:{}:{size}:{mtime_nanos}", relative_path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub transferred_at: DateTime<Utc>,
    pub destination_path: PathBuf,
}

impl HistoryRecord {
    pub fn now(destination_path: impl Into<PathBuf>) -> Self {
        Self {
            transferred_at: Utc::now(),
            destination_path: destination_path.into(),
        }
    }
}

/// Summary row appended after every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub destination_path: PathBuf,
    pub results: TransferCounts,
}

impl RunLogEntry {
    pub fn new(destination_path: &Path, results: TransferCounts) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            destination_path: destination_path.to_path_buf(),
            results,
        }
    }
}

#[derive(Default)]
struct HistoryState {
    records: HashMap<String, HistoryRecord>,
    pending: Vec<(String, HistoryRecord)>,
}

#[derive(Clone)]
pub struct HistoryStore {
    conn: Connection,
    state: Arc<Mutex<HistoryState>>,
}

impl HistoryStore {
    /// Load every recorded transfer into memory.
    pub async fn open(conn: Connection) -> Result<Self> {
        let rows = conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT identity, destination_path, transferred_at
                     FROM transferred ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        let mut state = HistoryState::default();
        for (identity, destination, transferred_at) in rows {
            match parse_timestamp(&transferred_at) {
                Some(transferred_at) => {
                    state.records.insert(
                        identity,
                        HistoryRecord {
                            transferred_at,
                            destination_path: PathBuf::from(destination),
                        },
                    );
                }
                None => warn!(identity = %identity, "Skipping history row with bad timestamp"),
            }
        }
        debug!(records = state.records.len(), "Loaded transfer history");

        Ok(Self {
            conn,
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        // A panicked writer leaves the maps intact; keep using them.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, identity: &SourceIdentity) -> Option<HistoryRecord> {
        self.lock().records.get(&identity.key()).cloned()
    }

    /// Record a confirmed transfer. Visible to `get` immediately, persisted on `flush`.
    pub fn put(&self, identity: &SourceIdentity, record: HistoryRecord) {
        let key = identity.key();
        let mut state = self.lock();
        state.records.insert(key.clone(), record.clone());
        state.pending.push((key, record));
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Append all buffered records in one transaction.
    ///
    /// On failure the records stay buffered for the next attempt.
    pub async fn flush(&self) -> Result<usize, EngineError> {
        let pending = std::mem::take(&mut self.lock().pending);
        if pending.is_empty() {
            return Ok(0);
        }

        let rows: Vec<(String, String, String)> = pending
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    record.destination_path.to_string_lossy().into_owned(),
                    format_timestamp(record.transferred_at),
                )
            })
            .collect();
        let count = rows.len();

        let result = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO transferred (identity, destination_path, transferred_at)
                         VALUES (?1, ?2, ?3)",
                    )?;
                    for (identity, destination, transferred_at) in &rows {
                        stmt.execute(params![identity, destination, transferred_at])?;
                    }
                }
                tx.commit()?;
                Ok::<(), rusqlite::Error>(())
            })
            .await;

        match result {
            Ok(()) => {
                debug!(records = count, "Flushed transfer history");
                Ok(count)
            }
            Err(e) => {
                let mut state = self.lock();
                let newer = std::mem::replace(&mut state.pending, pending);
                state.pending.extend(newer);
                Err(EngineError::History(e.to_string()))
            }
        }
    }

    pub async fn record_run(&self, entry: &RunLogEntry) -> Result<()> {
        let id = entry.id.clone();
        let timestamp = format_timestamp(entry.timestamp);
        let destination = entry.destination_path.to_string_lossy().into_owned();
        let results = serde_json::to_string(&entry.results)?;

        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO transfer_runs (id, timestamp, destination_path, results)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, timestamp, destination, results],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn runs(&self, limit: usize) -> Result<Vec<RunLogEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT id, timestamp, destination_path, results
                     FROM transfer_runs ORDER BY timestamp DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for (id, timestamp, destination, results) in rows {
            let Some(timestamp) = parse_timestamp(&timestamp) else {
                warn!(run_id = %id, "Skipping run with bad timestamp");
                continue;
            };
            runs.push(RunLogEntry {
                id,
                timestamp,
                destination_path: PathBuf::from(destination),
                results: serde_json::from_str(&results)?,
            });
        }
        Ok(runs)
    }
}

/// Fixed-width so text order matches time order.
fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::tempdir;

    fn content(bytes: &[u8]) -> SourceIdentity {
        SourceIdentity::Content(ContentHash::from_hash(blake3::hash(bytes)))
    }

    #[tokio::test]
    async fn test_put_is_visible_before_flush() {
        let store = HistoryStore::open(db::init_in_memory().await.unwrap())
            .await
            .unwrap();
        let id = content(b"a");

        assert!(store.get(&id).is_none());
        store.put(&id, HistoryRecord::now("/out/a.jpg"));

        assert_eq!(store.get(&id).unwrap().destination_path, PathBuf::from("/out/a.jpg"));
        assert_eq!(store.pending(), 1);
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.pending(), 0);
    }

    #[tokio::test]
    async fn test_flushed_records_survive_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/history.db");

        let store = HistoryStore::open(db::init(&path).await.unwrap()).await.unwrap();
        store.put(&content(b"a"), HistoryRecord::now("/out/first.jpg"));
        store.put(&content(b"a"), HistoryRecord::now("/out/second.jpg"));
        store.put(&content(b"b"), HistoryRecord::now("/out/b.jpg"));
        store.flush().await.unwrap();
        drop(store);

        let reopened = HistoryStore::open(db::init(&path).await.unwrap()).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.get(&content(b"a")).unwrap().destination_path,
            PathBuf::from("/out/second.jpg")
        );
    }

    #[tokio::test]
    async fn test_unflushed_records_are_lost() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("history.db");

        let store = HistoryStore::open(db::init(&path).await.unwrap()).await.unwrap();
        store.put(&content(b"a"), HistoryRecord::now("/out/a.jpg"));
        drop(store);

        let reopened = HistoryStore::open(db::init(&path).await.unwrap()).await.unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn test_run_log_newest_first() {
        let store = HistoryStore::open(db::init_in_memory().await.unwrap())
            .await
            .unwrap();

        let mut first = RunLogEntry::new(Path::new("/out/A_20240101_000000"), TransferCounts::default());
        first.timestamp = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let second = RunLogEntry::new(
            Path::new("/out/A_20240601_000000"),
            TransferCounts {
                success: 3,
                warned: 1,
                ..Default::default()
            },
        );
        store.record_run(&first).await.unwrap();
        store.record_run(&second).await.unwrap();

        let runs = store.runs(10).await.unwrap();
        assert_eq!(runs, vec![second.clone(), first]);
        assert_eq!(store.runs(1).await.unwrap(), vec![second]);
    }

    #[test]
    fn test_identity_keys() {
        let stat = SourceIdentity::Stat {
            relative_path: PathBuf::from("DCIM/100APPLE/IMG_0001.JPG"),
            size: 12,
            mtime_nanos: 34,
        };
        assert_eq!(stat.key(), "stat:DCIM/100APPLE/IMG_0001.JPG:12:34");
        assert!(content(b"x").key().starts_with("blake3:"));
    }
}
