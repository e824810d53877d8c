//! 检查点：每次运行结束时保存完整 AgentState，可按 id 恢复后以新问题继续会话

pub mod file;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::{AgentState, RunStatus};

pub use file::FileCheckpointStore;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("invalid checkpoint id: {0}")]
    InvalidId(String),

    #[error("unsupported checkpoint version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 检查点摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub query: String,
    pub current_step: u32,
    pub sql_count: usize,
    pub status: RunStatus,
    pub has_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub conversation_id: String,
    pub step: u32,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    pub meta: CheckpointMeta,
    pub state: AgentState,
}

/// `<conversation>_step<N>_<unix millis>`
pub fn make_checkpoint_id(conversation_id: &str, step: u32, at: DateTime<Utc>) -> String {
    format!("{}_step{}_{}", conversation_id, step, at.timestamp_millis())
}

impl Checkpoint {
    /// 为当前状态生成检查点；快照中的 checkpoint_id 指向自身
    pub fn capture(state: &AgentState) -> Self {
        let created_at = Utc::now();
        let id = make_checkpoint_id(&state.conversation_id, state.current_step, created_at);
        let mut snapshot = state.clone();
        snapshot.checkpoint_id = Some(id.clone());
        Self {
            conversation_id: state.conversation_id.clone(),
            step: state.current_step,
            created_at,
            version: CHECKPOINT_VERSION,
            meta: CheckpointMeta {
                query: state.query.clone(),
                current_step: state.current_step,
                sql_count: state.sql_history.len(),
                status: state.status,
                has_error: state.last_error.is_some(),
            },
            state: snapshot,
            id,
        }
    }

    /// 以新问题恢复：保留会话上下文，重置本次运行的计数
    pub fn resume(self, query: impl Into<String>) -> AgentState {
        let id = self.id;
        let mut state = self.state.resume_with(query);
        state.checkpoint_id = Some(id);
        state
    }

    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            step: self.step,
            created_at: self.created_at,
            meta: self.meta.clone(),
        }
    }

    fn check_version(&self) -> Result<(), CheckpointError> {
        if self.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(())
    }
}

/// 列表项（不含完整状态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: String,
    pub conversation_id: String,
    pub step: u32,
    pub created_at: DateTime<Utc>,
    pub meta: CheckpointMeta,
}

fn newest_first(items: &mut [CheckpointInfo]) {
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.step.cmp(&a.step))
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// 检查点存储
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError>;

    /// 按创建时间倒序；`conversation_id` 为 None 时列出全部
    async fn list(&self, conversation_id: Option<&str>) -> Result<Vec<CheckpointInfo>, CheckpointError>;

    /// 返回是否确实删除了文件/条目
    async fn delete(&self, id: &str) -> Result<bool, CheckpointError>;

    async fn latest(&self, conversation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.list(Some(conversation_id)).await?.first() {
            Some(info) => self.load(&info.id).await.map(Some),
            None => Ok(None),
        }
    }

    /// 只保留该会话最新的 `keep` 个，返回删除数
    async fn prune(&self, conversation_id: &str, keep: usize) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        for info in self.list(Some(conversation_id)).await?.into_iter().skip(keep) {
            if self.delete(&info.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// 内存实现（测试与不落盘场景）
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    items: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.items
            .write()
            .await
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self
            .items
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;
        checkpoint.check_version()?;
        Ok(checkpoint)
    }

    async fn list(&self, conversation_id: Option<&str>) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let mut items: Vec<CheckpointInfo> = self
            .items
            .read()
            .await
            .values()
            .filter(|c| conversation_id.map_or(true, |id| c.conversation_id == id))
            .map(Checkpoint::info)
            .collect();
        newest_first(&mut items);
        Ok(items)
    }

    async fn delete(&self, id: &str) -> Result<bool, CheckpointError> {
        Ok(self.items.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint(conv: &str, step: u32, offset_ms: i64) -> Checkpoint {
        let mut state = AgentState::new(format!("问题{step}"), conv);
        state.current_step = step;
        let mut cp = Checkpoint::capture(&state);
        cp.created_at += Duration::milliseconds(offset_ms);
        cp.id = make_checkpoint_id(conv, step, cp.created_at);
        cp
    }

    #[test]
    fn test_capture_meta() {
        let mut state = AgentState::new("杭州的5A景区", "conv-1");
        state.current_step = 2;
        state.sql_history = vec!["SELECT 1".into(), "SELECT 2".into()];
        state.last_error = Some("boom".into());
        let cp = Checkpoint::capture(&state);
        assert!(cp.id.starts_with("conv-1_step2_"));
        assert_eq!(cp.meta.sql_count, 2);
        assert!(cp.meta.has_error);
        assert_eq!(cp.state.checkpoint_id.as_deref(), Some(cp.id.as_str()));
        assert_eq!(cp.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn test_resume_resets_run_but_keeps_context() {
        let mut state = AgentState::new("旧问题", "conv");
        state.sql_history.push("SELECT 1".into());
        state.execution_results.push(crate::core::ExecutionResult::success(None, 1));
        state.current_step = 1;
        state.status = RunStatus::Success;
        let cp = Checkpoint::capture(&state);
        let id = cp.id.clone();

        let resumed = cp.resume("新问题");
        assert_eq!(resumed.query, "新问题");
        assert_eq!(resumed.current_step, 0);
        assert_eq!(resumed.sql_history.len(), 1);
        assert!(resumed.is_resumed);
        assert_eq!(resumed.checkpoint_id, Some(id));
    }

    #[tokio::test]
    async fn test_memory_store_list_latest_prune() {
        let store = MemoryCheckpointStore::new();
        for (step, offset) in [(1, 0), (2, 10), (3, 20)] {
            store.save(&checkpoint("a", step, offset)).await.unwrap();
        }
        store.save(&checkpoint("b", 1, 30)).await.unwrap();

        let listed = store.list(Some("a")).await.unwrap();
        assert_eq!(listed.iter().map(|i| i.step).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(store.list(None).await.unwrap().len(), 4);

        let latest = store.latest("a").await.unwrap().unwrap();
        assert_eq!(latest.step, 3);

        assert_eq!(store.prune("a", 1).await.unwrap(), 2);
        assert_eq!(store.list(Some("a")).await.unwrap().len(), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemoryCheckpointStore::new();
        assert!(matches!(
            store.load("missing").await,
            Err(CheckpointError::NotFound(_))
        ));
        assert!(!store.delete("missing").await.unwrap());
        assert!(store.latest("nobody").await.unwrap().is_none());
    }
}
