//! 工作流类型定义
//!
//! 步骤名、转移结果、运行参数、请求与结果、过程事件

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    AgentState, ErrorRecord, Intent, MatchMode, Record, RunStatus, ThoughtStep,
};

/// 状态机中的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    FetchSchema,
    AnalyzeIntent,
    EnhanceQuery,
    GenerateSql,
    ExecuteSql,
    HandleError,
    CheckResults,
    ValidateResults,
    GenerateAnswer,
}

impl StepName {
    pub const ENTRY: StepName = StepName::FetchSchema;

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::FetchSchema => "fetch-schema",
            StepName::AnalyzeIntent => "analyze-intent",
            StepName::EnhanceQuery => "enhance-query",
            StepName::GenerateSql => "generate-sql",
            StepName::ExecuteSql => "execute-sql",
            StepName::HandleError => "handle-error",
            StepName::CheckResults => "check-results",
            StepName::ValidateResults => "validate-results",
            StepName::GenerateAnswer => "generate-answer",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 转移表的输出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Step(StepName),
    End,
}

/// 引擎运行参数（由配置 `[engine]` 转换而来）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: u32,
    pub max_retries: u32,
    /// 单次运行的墙钟预算
    pub wall_clock: Duration,
    /// 单次运行的状态转移上限
    pub max_transitions: usize,
    pub llm_timeout: Duration,
    pub sql_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub simplify_limit: u32,
    pub completeness_stop: f64,
    pub completeness_floor: f64,
    pub required_fields: Vec<String>,
    pub merge_key: String,
    pub enable_validation: bool,
    pub max_validation_retries: u32,
    pub validation_sample_size: usize,
    pub answer_sample_size: usize,
    /// 每个会话保留的检查点数
    pub keep_checkpoints: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_retries: 5,
            wall_clock: Duration::from_secs(450),
            max_transitions: 40,
            llm_timeout: Duration::from_secs(60),
            sql_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(8000),
            simplify_limit: 50,
            completeness_stop: 0.9,
            completeness_floor: 0.3,
            required_fields: default_required_fields(),
            merge_key: "name".to_string(),
            enable_validation: true,
            max_validation_retries: 1,
            validation_sample_size: 5,
            answer_sample_size: 10,
            keep_checkpoints: 10,
        }
    }
}

pub fn default_required_fields() -> Vec<String> {
    ["name", "level", "coordinates", "评分", "门票", "介绍"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// 一次查询请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// 为空时生成新的会话 id
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// 从该检查点恢复会话上下文
    #[serde(default)]
    pub resume_from: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn resume_from(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.resume_from = Some(checkpoint_id.into());
        self
    }
}

/// 对外返回的查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: RunStatus,
    pub answer: String,
    pub message: String,
    /// 统计类查询不返回明细
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Record>>,
    pub count: usize,
    pub intent: Intent,
    pub sql: Option<String>,
    pub sql_history: Vec<String>,
    pub error_history: Vec<ErrorRecord>,
    pub thought_chain: Vec<ThoughtStep>,
    pub conversation_id: String,
    pub checkpoint_id: Option<String>,
    pub elapsed_ms: u64,
    pub from_cache: bool,
}

impl QueryResult {
    pub fn from_state(state: &AgentState, elapsed: Duration) -> Self {
        let should_return_data = state.intent.intent_type != crate::core::IntentType::Summary;
        Self {
            status: state.status,
            answer: state.answer.clone(),
            message: state.message.clone(),
            data: should_return_data.then(|| state.final_data.clone()),
            count: state.final_data.len(),
            intent: state.intent.clone(),
            sql: state.sql_history.last().cloned(),
            sql_history: state.sql_history.clone(),
            error_history: state.error_history.clone(),
            thought_chain: state.thought_chain.clone(),
            conversation_id: state.conversation_id.clone(),
            checkpoint_id: state.checkpoint_id.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
            from_cache: state.execution_results.iter().any(|r| r.from_cache),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// 运行过程事件（可序列化为 JSON 推送给前端）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StepStarted {
        conversation_id: String,
        step: StepName,
        transition: usize,
    },
    StepFinished {
        conversation_id: String,
        step: StepName,
        elapsed_ms: u64,
    },
    /// 连接类错误后的退避等待
    Backoff {
        conversation_id: String,
        delay_ms: u64,
    },
    Finished {
        conversation_id: String,
        status: RunStatus,
        elapsed_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionResult, IntentType};
    use serde_json::json;

    #[test]
    fn test_step_names() {
        assert_eq!(StepName::GenerateSql.to_string(), "generate-sql");
        assert_eq!(
            serde_json::to_value(StepName::HandleError).unwrap(),
            json!("handle-error")
        );
    }

    #[test]
    fn test_summary_result_omits_data() {
        let mut state = AgentState::new("有多少个景区", "c");
        state.intent.intent_type = IntentType::Summary;
        let mut r = Record::new();
        r.insert("count".into(), json!(12));
        state.final_data = vec![r];
        state.sql_history.push("SELECT count(*) FROM a_sight".into());
        state
            .execution_results
            .push(ExecutionResult::success(Some(state.final_data.clone()), 1));

        let result = QueryResult::from_state(&state, Duration::from_millis(5));
        assert!(result.data.is_none());
        assert_eq!(result.count, 1);
        assert_eq!(result.sql.as_deref(), Some("SELECT count(*) FROM a_sight"));
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_event_serialization() {
        let ev = EngineEvent::Backoff {
            conversation_id: "c".into(),
            delay_ms: 1000,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "backoff");
        assert_eq!(v["delay_ms"], 1000);
    }
}
