//! 单次查询运行的状态：AgentState 与步骤返回的 StateDelta
//!
//! 步骤处理器只读 AgentState 并返回 StateDelta，由工作流控制器统一合并；
//! 合并时维护不变式（current_step 单调、retry_count 不超预算、终态后冻结）。

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::CacheHit;
use crate::core::{ErrorType, FallbackStrategy};

/// 单条结果记录（json_agg 中的一个对象）
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    #[default]
    Query,
    Summary,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Query => "query",
            IntentType::Summary => "summary",
        }
    }
}

/// 文本条件匹配方式：默认模糊（ILIKE），用户明确要求时精确（=）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    #[default]
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Llm,
    #[default]
    Keyword,
}

/// 查询意图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    pub is_spatial: bool,
    pub confidence: f64,
    pub match_mode: MatchMode,
    /// 命中的触发关键词（仅诊断用）
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: IntentSource,
    #[serde(default = "default_true")]
    pub is_clear: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Intent {
    fn default() -> Self {
        Self {
            intent_type: IntentType::Query,
            is_spatial: false,
            confidence: 0.5,
            match_mode: MatchMode::Fuzzy,
            keywords: Vec::new(),
            description: String::new(),
            source: IntentSource::Keyword,
            is_clear: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

/// 一次 SQL 执行的结果，与 sql_history 一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub row_count: usize,
    pub data: Option<Vec<Record>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    /// 结果来自缓存而非数据库
    #[serde(default)]
    pub from_cache: bool,
}

impl ExecutionResult {
    pub fn success(data: Option<Vec<Record>>, elapsed_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            row_count: data.as_ref().map(Vec::len).unwrap_or(0),
            data,
            error: None,
            elapsed_ms,
            from_cache: false,
        }
    }

    pub fn failure(status: ExecutionStatus, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            status,
            row_count: 0,
            data: None,
            error: Some(error.into()),
            elapsed_ms,
            from_cache: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtStatus {
    Completed,
    Failed,
    Skipped,
}

/// 思维链条目：只追加的审计日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtStep {
    pub step: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    pub status: ThoughtStatus,
}

impl ThoughtStep {
    /// step 由合并时按思维链长度重新编号
    pub fn new(kind: &str, action: &str, status: ThoughtStatus) -> Self {
        Self {
            step: 0,
            kind: kind.to_string(),
            action: action.to_string(),
            input: None,
            output: None,
            status,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// 执行失败的上下文，供 RetrySql 修复提示使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub message: String,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub position: Option<usize>,
    pub line: Option<usize>,
    pub failed_at_step: u32,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// 错误记录：分类结果与所选策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step: u32,
    pub raw_error: String,
    pub classified_type: ErrorType,
    pub strategy: FallbackStrategy,
    pub retry_count: u32,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub sqlstate: Option<String>,
    #[serde(default)]
    pub position: Option<usize>,
    pub at: DateTime<Utc>,
}

/// LLM 结果校验给出的反馈
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFeedback {
    pub message: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Success,
    Error,
}

/// 在工作流中传递的唯一可变记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub query: String,
    pub enhanced_query: String,
    pub intent: Intent,

    pub schema: Option<String>,
    pub schema_fetched: bool,

    pub sql_history: Vec<String>,
    pub execution_results: Vec<ExecutionResult>,
    pub thought_chain: Vec<ThoughtStep>,
    /// 下一次要执行的 SQL；generate-sql 写入，execute-sql 消费
    pub current_sql: Option<String>,

    pub current_step: u32,
    pub max_iterations: u32,

    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub error_context: Option<ErrorContext>,
    pub error_history: Vec<ErrorRecord>,
    /// 本次运行的第一条错误记录在 error_history 中的下标；之前的记录属于被恢复的旧运行
    #[serde(default)]
    pub run_error_start: usize,
    pub fallback_strategy: FallbackStrategy,

    pub final_data: Vec<Record>,
    pub should_continue: bool,
    /// 生成了重复 SQL，细化循环结束
    pub refinement_exhausted: bool,

    pub validation_feedback: Option<ValidationFeedback>,
    pub validation_retry_count: u32,

    pub cached: Option<CacheHit>,
    pub cache_written: bool,

    pub status: RunStatus,
    pub answer: String,
    pub message: String,

    pub conversation_id: String,
    pub checkpoint_id: Option<String>,
    pub is_resumed: bool,
}

impl AgentState {
    pub fn new(query: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            enhanced_query: query.clone(),
            query,
            intent: Intent::default(),
            schema: None,
            schema_fetched: false,
            sql_history: Vec::new(),
            execution_results: Vec::new(),
            thought_chain: Vec::new(),
            current_sql: None,
            current_step: 0,
            max_iterations: 3,
            retry_count: 0,
            max_retries: 5,
            last_error: None,
            error_context: None,
            error_history: Vec::new(),
            run_error_start: 0,
            fallback_strategy: FallbackStrategy::None,
            final_data: Vec::new(),
            should_continue: true,
            refinement_exhausted: false,
            validation_feedback: None,
            validation_retry_count: 0,
            cached: None,
            cache_written: false,
            status: RunStatus::Pending,
            answer: String::new(),
            message: String::new(),
            conversation_id: conversation_id.into(),
            checkpoint_id: None,
            is_resumed: false,
        }
    }

    pub fn with_budgets(mut self, max_iterations: u32, max_retries: u32) -> Self {
        self.max_iterations = max_iterations;
        self.max_retries = max_retries;
        self
    }

    pub fn with_match_mode(mut self, match_mode: MatchMode) -> Self {
        self.intent.match_mode = match_mode;
        self
    }

    /// 以新问题继续旧会话：保留 schema、SQL 历史、错误历史与已合并数据，重置本次运行的计数与结论
    pub fn resume_with(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        let match_mode = self.intent.match_mode;
        self.enhanced_query = query.clone();
        self.query = query;
        self.intent = Intent {
            match_mode,
            ..Intent::default()
        };
        self.current_sql = None;
        self.current_step = 0;
        self.retry_count = 0;
        self.last_error = None;
        self.error_context = None;
        self.run_error_start = self.error_history.len();
        self.fallback_strategy = FallbackStrategy::None;
        self.should_continue = true;
        self.refinement_exhausted = false;
        self.validation_feedback = None;
        self.validation_retry_count = 0;
        self.cached = None;
        self.cache_written = false;
        self.status = RunStatus::Pending;
        self.answer.clear();
        self.message.clear();
        self.is_resumed = true;
        self
    }

    /// 已进入终态（Error 或已生成答案）
    pub fn is_finalized(&self) -> bool {
        self.status != RunStatus::Pending
    }

    pub fn retry_budget_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 本次运行中的错误记录
    pub fn run_errors(&self) -> &[ErrorRecord] {
        self.error_history
            .get(self.run_error_start..)
            .unwrap_or_default()
    }

    /// 本次运行中此前同类错误的次数
    pub fn prior_errors_of(&self, error_type: ErrorType) -> u32 {
        self.run_errors()
            .iter()
            .filter(|r| r.classified_type == error_type)
            .count() as u32
    }

    /// 合并步骤返回的 delta；返回需要控制器执行的退避时长
    pub fn apply(&mut self, delta: StateDelta) -> Option<Duration> {
        for mut thought in delta.thoughts {
            thought.step = self.thought_chain.len() + 1;
            self.thought_chain.push(thought);
        }
        if self.is_finalized() {
            return None;
        }

        if let Some(v) = delta.enhanced_query {
            self.enhanced_query = v;
        }
        if let Some(v) = delta.intent {
            self.intent = v;
        }
        if let Some(v) = delta.schema {
            self.schema = v;
        }
        if let Some(v) = delta.schema_fetched {
            self.schema_fetched = v;
        }
        if let Some(v) = delta.current_sql {
            self.current_sql = v;
        }
        if let Some((sql, result)) = delta.executed {
            self.sql_history.push(sql);
            self.execution_results.push(result);
        }
        if let Some(v) = delta.current_step {
            self.current_step = self.current_step.max(v);
        }
        if let Some(v) = delta.last_error {
            self.last_error = v;
        }
        if let Some(v) = delta.error_context {
            self.error_context = v;
        }
        if let Some(record) = delta.error_record {
            self.error_history.push(record);
        }
        if let Some(v) = delta.fallback_strategy {
            self.fallback_strategy = v;
        }
        if let Some(v) = delta.retry_count {
            if v > self.max_retries {
                self.retry_count = self.max_retries;
                self.fallback_strategy = FallbackStrategy::Fail;
                self.should_continue = false;
            } else {
                self.retry_count = v;
            }
        }
        if let Some(v) = delta.final_data {
            self.final_data = v;
        }
        if let Some(v) = delta.should_continue {
            self.should_continue = v;
        }
        if let Some(v) = delta.refinement_exhausted {
            self.refinement_exhausted = v;
        }
        if let Some(v) = delta.validation_feedback {
            self.validation_feedback = v;
        }
        if let Some(v) = delta.validation_retry_count {
            self.validation_retry_count = v;
        }
        if let Some(v) = delta.cached {
            self.cached = v;
        }
        if let Some(v) = delta.cache_written {
            self.cache_written = v;
        }
        if let Some(v) = delta.answer {
            self.answer = v;
        }
        if let Some(v) = delta.message {
            self.message = v;
        }
        if let Some(v) = delta.status {
            self.status = v;
        }
        if self.fallback_strategy == FallbackStrategy::Fail {
            self.should_continue = false;
        }
        delta.backoff
    }

    /// 检查不变式；违反时返回描述
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.sql_history.len() != self.execution_results.len() {
            return Err(format!(
                "sql_history ({}) and execution_results ({}) diverged",
                self.sql_history.len(),
                self.execution_results.len()
            ));
        }
        if self.retry_count > self.max_retries {
            return Err(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            ));
        }
        Ok(())
    }
}

/// 步骤处理器返回的显式增量
///
/// `Option<Option<T>>` 字段：外层 None 表示不修改，`Some(None)` 表示清空。
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    pub enhanced_query: Option<String>,
    pub intent: Option<Intent>,
    pub schema: Option<Option<String>>,
    pub schema_fetched: Option<bool>,
    pub current_sql: Option<Option<String>>,
    /// 成对追加到 sql_history / execution_results
    pub executed: Option<(String, ExecutionResult)>,
    pub thoughts: Vec<ThoughtStep>,
    pub current_step: Option<u32>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub error_context: Option<Option<ErrorContext>>,
    pub error_record: Option<ErrorRecord>,
    pub fallback_strategy: Option<FallbackStrategy>,
    pub final_data: Option<Vec<Record>>,
    pub should_continue: Option<bool>,
    pub refinement_exhausted: Option<bool>,
    pub validation_feedback: Option<Option<ValidationFeedback>>,
    pub validation_retry_count: Option<u32>,
    pub cached: Option<Option<CacheHit>>,
    pub cache_written: Option<bool>,
    pub status: Option<RunStatus>,
    pub answer: Option<String>,
    pub message: Option<String>,
    /// 不写入状态，由控制器执行
    pub backoff: Option<Duration>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thought(mut self, thought: ThoughtStep) -> Self {
        self.thoughts.push(thought);
        self
    }

    /// 清空上一次错误与回退策略（执行成功后）
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self.error_context = Some(None);
        self.fallback_strategy = Some(FallbackStrategy::None);
        self
    }

    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.last_error = Some(Some(message));
        self.fallback_strategy = Some(FallbackStrategy::Fail);
        self.should_continue = Some(false);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let s = AgentState::new("杭州的5A景区", "conv-1");
        assert_eq!(s.max_iterations, 3);
        assert_eq!(s.max_retries, 5);
        assert_eq!(s.enhanced_query, "杭州的5A景区");
        assert_eq!(s.status, RunStatus::Pending);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_executed_appends_in_pairs() {
        let mut s = AgentState::new("q", "c");
        let delta = StateDelta {
            executed: Some((
                "SELECT 1".to_string(),
                ExecutionResult::success(Some(vec![Record::new()]), 3),
            )),
            ..StateDelta::default()
        };
        s.apply(delta);
        assert_eq!(s.sql_history.len(), 1);
        assert_eq!(s.execution_results.len(), 1);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_current_step_is_monotonic() {
        let mut s = AgentState::new("q", "c");
        s.apply(StateDelta {
            current_step: Some(2),
            ..StateDelta::default()
        });
        s.apply(StateDelta {
            current_step: Some(1),
            ..StateDelta::default()
        });
        assert_eq!(s.current_step, 2);
    }

    #[test]
    fn test_retry_overflow_forces_fail() {
        let mut s = AgentState::new("q", "c").with_budgets(3, 2);
        s.apply(StateDelta {
            retry_count: Some(3),
            fallback_strategy: Some(FallbackStrategy::RetrySql),
            ..StateDelta::default()
        });
        assert_eq!(s.retry_count, 2);
        assert_eq!(s.fallback_strategy, FallbackStrategy::Fail);
        assert!(!s.should_continue);
        assert!(s.check_invariants().is_ok());
    }

    #[test]
    fn test_finalized_state_only_accepts_thoughts() {
        let mut s = AgentState::new("q", "c");
        s.apply(StateDelta {
            status: Some(RunStatus::Error),
            ..StateDelta::default()
        });
        s.apply(
            StateDelta {
                answer: Some("late".to_string()),
                current_step: Some(4),
                ..StateDelta::default()
            }
            .thought(ThoughtStep::new("audit", "late", ThoughtStatus::Skipped)),
        );
        assert_eq!(s.answer, "");
        assert_eq!(s.current_step, 0);
        assert_eq!(s.thought_chain.len(), 1);
        assert_eq!(s.thought_chain[0].step, 1);
    }

    #[test]
    fn test_resume_keeps_context() {
        let mut s = AgentState::new("old", "conv");
        s.sql_history.push("SELECT 1".into());
        s.execution_results.push(ExecutionResult::success(None, 1));
        s.current_step = 2;
        s.status = RunStatus::Success;
        s.answer = "done".into();
        let resumed = s.resume_with("new question");
        assert_eq!(resumed.query, "new question");
        assert_eq!(resumed.sql_history.len(), 1);
        assert_eq!(resumed.current_step, 0);
        assert_eq!(resumed.status, RunStatus::Pending);
        assert!(resumed.answer.is_empty());
        assert!(resumed.is_resumed);
    }

    fn unknown_error(step: u32) -> ErrorRecord {
        ErrorRecord {
            step,
            raw_error: "something odd happened".into(),
            classified_type: ErrorType::Unknown,
            strategy: FallbackStrategy::RetrySql,
            retry_count: 1,
            sql: None,
            sqlstate: None,
            position: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_resumed_run_counts_only_its_own_errors() {
        let mut s = AgentState::new("old", "conv");
        s.error_history.push(unknown_error(0));
        assert_eq!(s.prior_errors_of(ErrorType::Unknown), 1);

        let mut resumed = s.resume_with("new question");
        assert_eq!(resumed.error_history.len(), 1);
        assert_eq!(resumed.prior_errors_of(ErrorType::Unknown), 0);

        resumed.apply(StateDelta {
            error_record: Some(unknown_error(1)),
            ..StateDelta::default()
        });
        assert_eq!(resumed.prior_errors_of(ErrorType::Unknown), 1);
        assert_eq!(resumed.run_errors().len(), 1);
    }

    #[test]
    fn test_run_error_start_survives_checkpoint_round_trip() {
        let mut s = AgentState::new("old", "conv");
        s.error_history.push(unknown_error(0));
        let resumed = s.resume_with("new question");
        let json = serde_json::to_value(&resumed).unwrap();
        let restored: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(restored.run_error_start, 1);
        assert_eq!(restored.prior_errors_of(ErrorType::Unknown), 0);
    }
}
