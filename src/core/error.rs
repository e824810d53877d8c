//! 引擎错误类型、执行错误分类与回退策略
//!
//! 与 RecoveryPolicy 配合：ErrorType 决定 FallbackStrategy（RetrySql / SimplifyQuery / RetryExecution / Fail）。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::checkpoint::CheckpointError;
use crate::db::DbError;
use crate::llm::LlmError;

/// 引擎层错误：终止条件与各协作方错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Retry budget exhausted after {0} retries")]
    RetryBudgetExhausted(u32),

    #[error("Wall clock budget exceeded: {elapsed_ms}ms > {budget_ms}ms")]
    WallClockExceeded { elapsed_ms: u64, budget_ms: u64 },

    /// 状态转移次数超过上限（防止 generate-sql / handle-error / check-results 之间振荡）
    #[error("Step limit exceeded: {0} transitions")]
    StepLimitExceeded(usize),

    #[error("Run cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// SQL 执行失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    SqlSyntax,
    ExecutionTimeout,
    Connection,
    Field,
    Permission,
    DataFormat,
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::SqlSyntax,
        ErrorType::ExecutionTimeout,
        ErrorType::Connection,
        ErrorType::Field,
        ErrorType::Permission,
        ErrorType::DataFormat,
        ErrorType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::SqlSyntax => "sql_syntax",
            ErrorType::ExecutionTimeout => "execution_timeout",
            ErrorType::Connection => "connection",
            ErrorType::Field => "field",
            ErrorType::Permission => "permission",
            ErrorType::DataFormat => "data_format",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类后选定的恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    #[default]
    None,
    /// 带错误上下文让 LLM 修复上一条 SQL
    RetrySql,
    /// 不调用 LLM，机械地加/改 LIMIT
    SimplifyQuery,
    /// 原样重新执行（连接类错误，指数退避）
    RetryExecution,
    /// 不可恢复，终止
    Fail,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::None => "none",
            FallbackStrategy::RetrySql => "retry_sql",
            FallbackStrategy::SimplifyQuery => "simplify_query",
            FallbackStrategy::RetryExecution => "retry_execution",
            FallbackStrategy::Fail => "fail",
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
