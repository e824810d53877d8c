//! QueryEngine 构建器
//!
//! 协作方通过构造注入，测试可替换为假实现

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::cache::QueryCache;
use crate::checkpoint::CheckpointStore;
use crate::core::{EngineError, ErrorClassifier, ErrorStats, RecoveryPolicy};
use crate::db::{SchemaProvider, SqlExecutor};
use crate::llm::{EmbeddingProvider, LlmClient};
use crate::workflow::engine::QueryEngine;
use crate::workflow::types::{EngineEvent, EngineSettings};

#[derive(Default)]
pub struct QueryEngineBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    executor: Option<Arc<dyn SqlExecutor>>,
    schema: Option<Arc<dyn SchemaProvider>>,
    cache: Option<QueryCache>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    settings: EngineSettings,
    event_tx: Option<UnboundedSender<EngineEvent>>,
}

impl QueryEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn SqlExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn schema_provider(mut self, schema: Arc<dyn SchemaProvider>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// 语义缓存使用的向量模型；未设置时缓存只做精确匹配
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 运行过程事件推送通道
    pub fn events(mut self, tx: UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Result<QueryEngine, EngineError> {
        let llm = self
            .llm
            .ok_or_else(|| EngineError::Config("llm client is required".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| EngineError::Config("sql executor is required".to_string()))?;
        let schema = self
            .schema
            .ok_or_else(|| EngineError::Config("schema provider is required".to_string()))?;
        if self.settings.max_iterations == 0 {
            return Err(EngineError::Config("max_iterations must be at least 1".to_string()));
        }

        let cache = match (self.cache, self.embedder) {
            (Some(cache), Some(embedder)) => Some(Arc::new(cache.with_embedder(embedder))),
            (cache, _) => cache.map(Arc::new),
        };
        let policy = RecoveryPolicy::new(self.settings.backoff_base, self.settings.backoff_cap);

        Ok(QueryEngine {
            llm,
            executor,
            schema,
            cache,
            checkpoints: self.checkpoints,
            settings: self.settings,
            classifier: ErrorClassifier::new(),
            policy,
            stats: Mutex::new(ErrorStats::default()),
            event_tx: self.event_tx,
        })
    }
}
