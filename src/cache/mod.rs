//! 查询结果缓存
//!
//! 两级查找：
//! - 精确：`sha256(规范化查询|意图类型|空间标记)`
//! - 语义：查询向量与已缓存向量的余弦相似度，取 top-1 且不低于阈值
//!
//! 条目按 TTL 过期，超过容量时按最近访问时间淘汰（LRU）。
//! 索引在内存中：查找只持读锁，访问时间与命中数是条目上的原子量；
//! 写入按缓存键加锁。可选 SQLite 持久化（写穿）。

pub mod embedder;
pub mod key;
pub mod store;
pub mod tokenizer;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::{ExecutionResult, Intent, IntentType, KeyedLocks, Record};
use crate::llm::EmbeddingProvider;

pub use embedder::{cosine_similarity, HashingEmbedder};
pub use key::{cache_key, normalize_query};
pub use store::SqliteCacheStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Task(String),

    #[error("result is not cacheable: {0}")]
    NotCacheable(String),
}

/// 缓存参数
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_size: usize,
    pub semantic_enabled: bool,
    pub semantic_threshold: f32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_size: 500,
            semantic_enabled: true,
            semantic_threshold: 0.92,
        }
    }
}

/// 持久化的结果部分：`{sql, execution_result, final_data, created_at}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePayload {
    pub sql: String,
    pub execution_result: ExecutionResult,
    pub final_data: Vec<Record>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub query: String,
    pub intent_type: IntentType,
    pub is_spatial: bool,
    pub payload: CachePayload,
    pub embedding: Option<Vec<f32>>,
    /// 生成 embedding 的提供方；与当前提供方不同的向量不参与比较
    pub embedder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub ttl_secs: u64,
    pub hits: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.created_at).num_milliseconds() >= (self.ttl_secs as i64).saturating_mul(1000)
    }

    fn to_hit(&self, similarity: f32, semantic: bool) -> CacheHit {
        CacheHit {
            key: self.key.clone(),
            query: self.query.clone(),
            sql: self.payload.sql.clone(),
            execution_result: self.payload.execution_result.clone(),
            final_data: self.payload.final_data.clone(),
            similarity,
            semantic,
        }
    }
}

/// 内存中的条目：`entry` 里的 last_access / hits 只是载入或写入时的值，之后以 `access` 为准
#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    access: Access,
}

#[derive(Debug)]
struct Access {
    last_access_ms: AtomicI64,
    hits: AtomicU64,
}

impl Slot {
    fn new(entry: CacheEntry) -> Self {
        let access = Access {
            last_access_ms: AtomicI64::new(entry.last_access.timestamp_millis()),
            hits: AtomicU64::new(entry.hits),
        };
        Self { entry, access }
    }

    /// 记录一次命中，返回累计命中数
    fn touch(&self, now: DateTime<Utc>) -> u64 {
        self.access
            .last_access_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        self.access.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn last_access_ms(&self) -> i64 {
        self.access.last_access_ms.load(Ordering::Relaxed)
    }
}

/// 命中结果，写入 AgentState 供 generate-sql / execute-sql 复用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHit {
    pub key: String,
    /// 命中条目的原始查询
    pub query: String,
    pub sql: String,
    pub execution_result: ExecutionResult,
    pub final_data: Vec<Record>,
    pub similarity: f32,
    pub semantic: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub semantic_hits: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct QueryCache {
    settings: CacheSettings,
    entries: RwLock<HashMap<String, Slot>>,
    locks: KeyedLocks,
    store: Option<SqliteCacheStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    hits: AtomicU64,
    misses: AtomicU64,
    semantic_hits: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    /// 仅内存
    pub fn in_memory(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            store: None,
            embedder: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            semantic_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// 打开 SQLite 持久化缓存并加载未过期条目
    pub async fn open(path: impl AsRef<Path>, settings: CacheSettings) -> Result<Self, CacheError> {
        let store = SqliteCacheStore::open(path)?;
        let now = Utc::now();
        let mut live = HashMap::new();
        let mut expired = Vec::new();
        for entry in store.load_all().await? {
            if entry.is_expired(now) {
                expired.push(entry.key);
            } else {
                live.insert(entry.key.clone(), Slot::new(entry));
            }
        }
        let removed = store.delete(expired).await?;
        info!(
            path = %store.path().display(),
            entries = live.len(),
            expired = removed,
            "query cache loaded"
        );

        let mut cache = Self::in_memory(settings);
        cache.entries = RwLock::new(live);
        cache.store = Some(store);
        Ok(cache)
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    fn semantic_embedder(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.embedder
            .as_ref()
            .filter(|_| self.settings.semantic_enabled)
    }

    /// 查找：先精确后语义；过期条目视为未命中并删除
    pub async fn lookup(&self, query: &str, intent: &Intent) -> Option<CacheHit> {
        let key = cache_key(query, intent);
        let now = Utc::now();

        if let Some(hit) = self.lookup_exact(&key, now).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache exact hit");
            return Some(hit);
        }

        if let Some(hit) = self.lookup_semantic(query, intent, now).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.semantic_hits.fetch_add(1, Ordering::Relaxed);
            info!(
                similarity = hit.similarity,
                cached_query = %hit.query,
                "cache semantic hit"
            );
            return Some(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn lookup_exact(&self, key: &str, now: DateTime<Utc>) -> Option<CacheHit> {
        let fresh = {
            let entries = self.entries.read().await;
            let slot = entries.get(key)?;
            if slot.entry.is_expired(now) {
                None
            } else {
                Some((slot.entry.to_hit(1.0, false), slot.touch(now)))
            }
        };
        let Some((hit, hits)) = fresh else {
            self.remove_expired(key, now).await;
            return None;
        };
        self.touch_persisted(key, now, hits).await;
        Some(hit)
    }

    /// 过期条目在写锁下复查后删除（期间可能已被重新写入）
    async fn remove_expired(&self, key: &str, now: DateTime<Utc>) {
        let removed = {
            let mut entries = self.entries.write().await;
            let expired = entries.get(key).is_some_and(|slot| slot.entry.is_expired(now));
            if expired {
                entries.remove(key);
            }
            expired
        };
        if removed {
            debug!(key = %key, "cache entry expired");
            self.remove_persisted(vec![key.to_string()]).await;
        }
    }

    async fn lookup_semantic(&self, query: &str, intent: &Intent, now: DateTime<Utc>) -> Option<CacheHit> {
        let embedder = self.semantic_embedder()?;
        let vector = match embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "query embedding failed, skipping semantic lookup");
                return None;
            }
        };

        let (hit, hits) = {
            let entries = self.entries.read().await;
            let (slot, similarity) = entries
                .values()
                .filter(|s| {
                    let e = &s.entry;
                    e.intent_type == intent.intent_type
                        && e.is_spatial == intent.is_spatial
                        && !e.is_expired(now)
                        && e.embedder.as_deref() == Some(embedder.name())
                })
                .filter_map(|s| {
                    s.entry
                        .embedding
                        .as_ref()
                        .map(|v| (s, cosine_similarity(&vector, v)))
                })
                .filter(|(_, sim)| *sim >= self.settings.semantic_threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            let hits = slot.touch(now);
            (slot.entry.to_hit(similarity, true), hits)
        };
        self.touch_persisted(&hit.key, now, hits).await;
        Some(hit)
    }

    /// 写入一次成功执行的结果，返回缓存键
    pub async fn put(
        &self,
        query: &str,
        intent: &Intent,
        sql: &str,
        execution_result: &ExecutionResult,
        final_data: &[Record],
    ) -> Result<String, CacheError> {
        if !execution_result.is_success() {
            return Err(CacheError::NotCacheable(format!(
                "execution status {:?}",
                execution_result.status
            )));
        }

        let key = cache_key(query, intent);
        let _guard = self.locks.lock(&key).await;

        let (embedding, embedder) = match self.semantic_embedder() {
            Some(e) => match e.embed(query).await {
                Ok(v) if !v.is_empty() => (Some(v), Some(e.name().to_string())),
                Ok(_) => (None, None),
                Err(err) => {
                    warn!(error = %err, "embedding failed, entry stored without vector");
                    (None, None)
                }
            },
            None => (None, None),
        };

        let now = Utc::now();
        let mut stored_result = execution_result.clone();
        stored_result.from_cache = false;
        let entry = CacheEntry {
            key: key.clone(),
            query: query.to_string(),
            intent_type: intent.intent_type,
            is_spatial: intent.is_spatial,
            payload: CachePayload {
                sql: sql.to_string(),
                execution_result: stored_result,
                final_data: final_data.to_vec(),
                created_at: now,
            },
            embedding,
            embedder,
            created_at: now,
            last_access: now,
            ttl_secs: self.settings.ttl_secs,
            hits: 0,
        };

        let evicted = {
            let mut entries = self.entries.write().await;
            entries.insert(key.clone(), Slot::new(entry.clone()));
            evict_lru(&mut entries, self.settings.max_size, &key)
        };
        if !evicted.is_empty() {
            self.evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(count = evicted.len(), "cache entries evicted");
        }

        if let Some(store) = &self.store {
            store.upsert(entry).await?;
            store.delete(evicted).await?;
        }
        debug!(key = %key, "cache entry stored");
        Ok(key)
    }

    /// 删除所有过期条目，返回删除数
    pub async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<String> = entries
                .values()
                .filter(|s| s.entry.is_expired(now))
                .map(|s| s.entry.key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        let count = expired.len();
        if let Some(store) = &self.store {
            store.delete(expired).await?;
        }
        if count > 0 {
            info!(count, "expired cache entries removed");
        }
        Ok(count)
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.len().await,
            hits,
            misses,
            semantic_hits: self.semantic_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    async fn touch_persisted(&self, key: &str, at: DateTime<Utc>, hits: u64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.touch(key.to_string(), at, hits).await {
                warn!(error = %e, "failed to persist cache access time");
            }
        }
    }

    async fn remove_persisted(&self, keys: Vec<String>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(keys).await {
                warn!(error = %e, "failed to delete expired cache entry");
            }
        }
    }
}

/// 超出容量时淘汰最久未访问的条目（不淘汰刚写入的 `keep`）
fn evict_lru(entries: &mut HashMap<String, Slot>, max_size: usize, keep: &str) -> Vec<String> {
    let mut evicted = Vec::new();
    while entries.len() > max_size.max(1) {
        let oldest = entries
            .values()
            .filter(|s| s.entry.key != keep)
            .min_by_key(|s| s.last_access_ms())
            .map(|s| s.entry.key.clone());
        match oldest {
            Some(key) => {
                entries.remove(&key);
                evicted.push(key);
            }
            None => break,
        }
    }
    evicted
}
