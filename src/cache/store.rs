//! SQLite 持久化：query_cache 存结果 JSON，query_cache_meta 存 TTL 与访问信息
//!
//! rusqlite 是同步接口，所有访问经 `spawn_blocking` 在阻塞线程池执行。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{CacheEntry, CacheError, CachePayload};
use crate::core::IntentType;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS query_cache (
  key TEXT PRIMARY KEY,
  query TEXT NOT NULL,
  intent_type TEXT NOT NULL,
  is_spatial INTEGER NOT NULL,
  payload TEXT NOT NULL,
  embedding TEXT,
  embedder TEXT
);
CREATE TABLE IF NOT EXISTS query_cache_meta (
  key TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  last_access TEXT NOT NULL,
  ttl_secs INTEGER NOT NULL,
  hits INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Clone)]
pub struct SqliteCacheStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCacheStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteCacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }

    pub async fn load_all(&self) -> Result<Vec<CacheEntry>, CacheError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.key, c.query, c.intent_type, c.is_spatial, c.payload, c.embedding, c.embedder,
                        m.created_at, m.last_access, m.ttl_secs, m.hits
                 FROM query_cache c JOIN query_cache_meta m ON m.key = c.key",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RawRow {
                    key: row.get(0)?,
                    query: row.get(1)?,
                    intent_type: row.get(2)?,
                    is_spatial: row.get(3)?,
                    payload: row.get(4)?,
                    embedding: row.get(5)?,
                    embedder: row.get(6)?,
                    created_at: row.get(7)?,
                    last_access: row.get(8)?,
                    ttl_secs: row.get(9)?,
                    hits: row.get(10)?,
                })
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let row = row?;
                match row.into_entry() {
                    Ok(entry) => entries.push(entry),
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable cache row"),
                }
            }
            Ok(entries)
        })
        .await
    }

    pub async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let payload = serde_json::to_string(&entry.payload)?;
        let embedding = entry
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO query_cache (key, query, intent_type, is_spatial, payload, embedding, embedder)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.key,
                    entry.query,
                    entry.intent_type.as_str(),
                    entry.is_spatial,
                    payload,
                    embedding,
                    entry.embedder,
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO query_cache_meta (key, created_at, last_access, ttl_secs, hits)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.key,
                    entry.created_at,
                    entry.last_access,
                    entry.ttl_secs as i64,
                    entry.hits as i64,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn touch(&self, key: String, last_access: DateTime<Utc>, hits: u64) -> Result<(), CacheError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE query_cache_meta SET last_access = ?2, hits = ?3 WHERE key = ?1",
                params![key, last_access, hits as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, keys: Vec<String>) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for key in &keys {
                removed += tx.execute("DELETE FROM query_cache WHERE key = ?1", params![key])?;
                tx.execute("DELETE FROM query_cache_meta WHERE key = ?1", params![key])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.with_conn(|conn| {
            conn.execute_batch("DELETE FROM query_cache; DELETE FROM query_cache_meta;")?;
            Ok(())
        })
        .await
    }
}

struct RawRow {
    key: String,
    query: String,
    intent_type: String,
    is_spatial: bool,
    payload: String,
    embedding: Option<String>,
    embedder: Option<String>,
    created_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    ttl_secs: i64,
    hits: i64,
}

impl RawRow {
    fn into_entry(self) -> Result<CacheEntry, CacheError> {
        let payload: CachePayload = serde_json::from_str(&self.payload)?;
        let embedding = self
            .embedding
            .as_deref()
            .map(serde_json::from_str::<Vec<f32>>)
            .transpose()?;
        let intent_type = match self.intent_type.as_str() {
            "summary" => IntentType::Summary,
            _ => IntentType::Query,
        };
        Ok(CacheEntry {
            key: self.key,
            query: self.query,
            intent_type,
            is_spatial: self.is_spatial,
            payload,
            embedding,
            embedder: self.embedder,
            created_at: self.created_at,
            last_access: self.last_access,
            ttl_secs: self.ttl_secs.max(0) as u64,
            hits: self.hits.max(0) as u64,
        })
    }
}
