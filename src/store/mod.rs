//! SQLite-backed persistent store for collected artifacts and checkpoints
//!
//! One append-only table for generic entries and a structurally independent
//! table for checkpoint blobs, so clearing data entries never touches
//! checkpoints. Content and metadata are stored as JSON text and round-trip
//! through serde. Storage failures propagate to the caller; nothing is
//! retried locally.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;
use crate::model::{Adam, ModelState};

/// One immutable row of the generic entry log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Monotonically increasing, unique per store
    pub id: i64,
    pub entry_type: String,
    pub content: serde_json::Value,
    pub metadata: Option<BTreeMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

/// Key and creation time of one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// Entry and checkpoint counts
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_entries: usize,
    pub total_checkpoints: usize,
}

/// Durable append-only store over SQLite
pub struct PersistentStore {
    conn: Arc<Mutex<Connection>>,
}

impl PersistentStore {
    /// Open (or create) a store at the given path
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        info!("Persistent store ready at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and throwaway sessions
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Generic append-only entry log
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                timestamp TEXT NOT NULL
            );

            -- Checkpoint blobs, independent of the entry log
            CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                model_state TEXT NOT NULL,
                optimizer_state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_type ON entries(entry_type);
            CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp DESC);
        "#,
        )?;
        Ok(())
    }

    /// Append one entry; existing entries are never mutated
    pub async fn store(
        &self,
        entry_type: &str,
        content: &serde_json::Value,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;

        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO entries (entry_type, content, metadata, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry_type,
                serde_json::to_string(content)?,
                metadata_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch entries newest first, optionally filtered by exact type
    pub async fn retrieve(&self, entry_type: Option<&str>, limit: usize) -> Result<Vec<StoreEntry>> {
        let conn = self.conn.lock().await;

        let mut rows: Vec<(i64, String, String, Option<String>, String)> = Vec::new();
        if let Some(entry_type) = entry_type {
            let mut stmt = conn.prepare_cached(
                "SELECT id, entry_type, content, metadata, timestamp
                 FROM entries WHERE entry_type = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![entry_type, limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            for row in mapped {
                rows.push(row?);
            }
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT id, entry_type, content, metadata, timestamp
                 FROM entries ORDER BY id DESC LIMIT ?1",
            )?;
            let mapped = stmt.query_map(params![limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            for row in mapped {
                rows.push(row?);
            }
        }

        rows.into_iter()
            .map(|(id, entry_type, content, metadata, timestamp)| {
                Ok(StoreEntry {
                    id,
                    entry_type,
                    content: serde_json::from_str(&content)?,
                    metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
                    timestamp: parse_timestamp(&timestamp),
                })
            })
            .collect()
    }

    /// Delete entries, either all of them or only those older than the given
    /// age in days; checkpoints are untouched either way
    pub async fn clear(&self, older_than_days: Option<u32>) -> Result<usize> {
        let conn = self.conn.lock().await;

        let deleted = match older_than_days {
            Some(days) => {
                let cutoff = Utc::now() - Duration::days(i64::from(days));
                conn.execute(
                    "DELETE FROM entries WHERE timestamp < ?1",
                    params![cutoff.to_rfc3339()],
                )?
            }
            None => conn.execute("DELETE FROM entries", [])?,
        };
        info!("Cleared {deleted} entries from the store");
        Ok(deleted)
    }

    /// Persist one checkpoint; returns its timestamp-derived key
    ///
    /// Keys order monotonically even when two checkpoints land within the
    /// same millisecond.
    pub async fn save_checkpoint(&self, model: &ModelState, optimizer: &Adam) -> Result<String> {
        let conn = self.conn.lock().await;

        let last_key: Option<String> = conn
            .query_row(
                "SELECT key FROM checkpoints ORDER BY key DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let now = Utc::now();
        let mut millis = now.timestamp_millis();
        if let Some(last) = last_key.and_then(|k| parse_checkpoint_millis(&k)) {
            if millis <= last {
                millis = last + 1;
            }
        }
        let key = format!("ckpt-{millis:013}");

        conn.execute(
            "INSERT INTO checkpoints (key, model_state, optimizer_state, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key,
                serde_json::to_string(model)?,
                serde_json::to_string(optimizer)?,
                now.to_rfc3339(),
            ],
        )?;
        Ok(key)
    }

    /// List checkpoint keys in ascending (oldest-first) order
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>> {
        let conn = self.conn.lock().await;

        let mut stmt =
            conn.prepare_cached("SELECT key, created_at FROM checkpoints ORDER BY key ASC")?;
        let mapped = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let created_at: String = row.get(1)?;
            Ok((key, created_at))
        })?;

        let mut metas = Vec::new();
        for row in mapped {
            let (key, created_at) = row?;
            metas.push(CheckpointMeta {
                key,
                created_at: parse_timestamp(&created_at),
            });
        }
        Ok(metas)
    }

    /// Load one checkpoint by key
    pub async fn load_checkpoint(&self, key: &str) -> Result<Option<(ModelState, Adam)>> {
        let conn = self.conn.lock().await;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT model_state, optimizer_state FROM checkpoints WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((model_json, optimizer_json)) => Ok(Some((
                serde_json::from_str(&model_json)?,
                serde_json::from_str(&optimizer_json)?,
            ))),
            None => Ok(None),
        }
    }

    /// Load the newest checkpoint, if any
    pub async fn load_latest_checkpoint(&self) -> Result<Option<(String, ModelState, Adam)>> {
        let latest = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT key FROM checkpoints ORDER BY key DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        };
        match latest {
            Some(key) => match self.load_checkpoint(&key).await? {
                Some((model, optimizer)) => Ok(Some((key, model, optimizer))),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Drop all but the newest `keep_last` checkpoints
    pub async fn prune_checkpoints(&self, keep_last: usize) -> Result<usize> {
        let conn = self.conn.lock().await;

        let deleted = conn.execute(
            r#"DELETE FROM checkpoints WHERE key IN (
                SELECT key FROM checkpoints
                ORDER BY key DESC
                LIMIT -1 OFFSET ?1
            )"#,
            params![keep_last],
        )?;
        if deleted > 0 {
            info!("Pruned {deleted} old checkpoints");
        }
        Ok(deleted)
    }

    /// Entry and checkpoint counts
    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;

        let entries: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        let checkpoints: i64 =
            conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;

        Ok(StoreStats {
            total_entries: entries as usize,
            total_checkpoints: checkpoints as usize,
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_checkpoint_millis(key: &str) -> Option<i64> {
    key.strip_prefix("ckpt-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FusionModel, ModelHyperparams};
    use serde_json::json;

    #[tokio::test]
    async fn test_store_then_retrieve_returns_inserted_entry() {
        let store = PersistentStore::in_memory().await.unwrap();

        let id = store
            .store("training_data", &json!({"text": "hello"}), None)
            .await
            .unwrap();
        let entries = store.retrieve(Some("training_data"), 1).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].content, json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_and_order_newest_first() {
        let store = PersistentStore::in_memory().await.unwrap();

        let a = store.store("x", &json!(1), None).await.unwrap();
        let b = store.store("x", &json!(2), None).await.unwrap();
        let c = store.store("y", &json!(3), None).await.unwrap();
        assert!(a < b && b < c);

        let entries = store.retrieve(None, 100).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![c, b, a]);

        let filtered = store.retrieve(Some("x"), 100).await.unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let store = PersistentStore::in_memory().await.unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "unit-test".to_string());

        store
            .store("record", &json!({"k": [1, 2, 3]}), Some(&metadata))
            .await
            .unwrap();
        let entries = store.retrieve(Some("record"), 1).await.unwrap();
        assert_eq!(entries[0].metadata.as_ref().unwrap()["source"], "unit-test");
    }

    #[tokio::test]
    async fn test_clear_leaves_checkpoints_untouched() {
        let store = PersistentStore::in_memory().await.unwrap();
        let model = FusionModel::new(ModelHyperparams::default()).unwrap();

        store.store("x", &json!(1), None).await.unwrap();
        store
            .save_checkpoint(&model.save_state(), &model.optimizer_state())
            .await
            .unwrap();

        let removed = store.clear(None).await.unwrap();
        assert_eq!(removed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_checkpoints, 1);
    }

    #[tokio::test]
    async fn test_clear_by_age_keeps_fresh_entries() {
        let store = PersistentStore::in_memory().await.unwrap();
        store.store("x", &json!(1), None).await.unwrap();

        // Nothing is older than 30 days.
        assert_eq!(store.clear(Some(30)).await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_and_key_ordering() {
        let store = PersistentStore::in_memory().await.unwrap();
        let model = FusionModel::new(ModelHyperparams::default()).unwrap();
        let state = model.save_state();
        let optimizer = model.optimizer_state();

        let k1 = store.save_checkpoint(&state, &optimizer).await.unwrap();
        let k2 = store.save_checkpoint(&state, &optimizer).await.unwrap();
        assert!(k2 > k1, "keys must order monotonically: {k1} !< {k2}");

        let listed = store.list_checkpoints().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, k1);

        let (loaded, _adam) = store.load_checkpoint(&k1).await.unwrap().unwrap();
        assert_eq!(loaded.config, state.config);

        let (latest_key, _, _) = store.load_latest_checkpoint().await.unwrap().unwrap();
        assert_eq!(latest_key, k2);
    }

    #[tokio::test]
    async fn test_prune_checkpoints_keeps_newest() {
        let store = PersistentStore::in_memory().await.unwrap();
        let model = FusionModel::new(ModelHyperparams::default()).unwrap();
        let state = model.save_state();
        let optimizer = model.optimizer_state();

        let mut keys = Vec::new();
        for _ in 0..5 {
            keys.push(store.save_checkpoint(&state, &optimizer).await.unwrap());
        }
        let removed = store.prune_checkpoints(2).await.unwrap();
        assert_eq!(removed, 3);

        let remaining = store.list_checkpoints().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[1].key, *keys.last().unwrap());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let store = PersistentStore::in_memory().await.unwrap();
        assert!(store.load_checkpoint("ckpt-000").await.unwrap().is_none());
        assert!(store.load_latest_checkpoint().await.unwrap().is_none());
    }
}
