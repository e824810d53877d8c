//! 数据库协作方：SQL 执行与 Schema 获取
//!
//! 引擎只依赖 [`SqlExecutor`] / [`SchemaProvider`] 两个 trait；PostgreSQL 实现见 `postgres`（feature）。
//! 执行器内部不做重试，超时与取消由 [`execute_bounded`] 施加。

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::Record;

pub use mock::{DryRunExecutor, InMemoryExecutor, StaticSchemaProvider, SIGHT_SCHEMA};
#[cfg(feature = "postgres")]
pub use postgres::{connect_pool, PgExecutor, PgSchemaProvider};

/// 执行错误：原始消息，附带后端提供的 SQLSTATE / 出错位置（若有）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub message: String,
    pub sqlstate: Option<String>,
    pub position: Option<usize>,
    pub timed_out: bool,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            position: None,
            timed_out: false,
        }
    }

    pub fn with_sqlstate(mut self, code: impl Into<String>) -> Self {
        self.sqlstate = Some(code.into());
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            message: format!("query timed out after {}ms", after.as_millis()),
            sqlstate: None,
            position: None,
            timed_out: true,
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(code) = &self.sqlstate {
            write!(f, " (SQLSTATE {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}

/// SQL 执行协作方：`Execute(sql) -> (rows, error)`
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Record>, DbError>;
}

/// Schema 协作方：每次运行最多调用一次
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn fetch_schema(&self) -> Result<String, DbError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecFailure {
    Timeout(DbError),
    Cancelled,
    Failed(DbError),
}

/// 单次有界执行
pub async fn execute_bounded(
    executor: &dyn SqlExecutor,
    sql: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Record>, ExecFailure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecFailure::Cancelled),
        res = tokio::time::timeout(timeout, executor.execute(sql)) => match res {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) if e.timed_out => Err(ExecFailure::Timeout(e)),
            Ok(Err(e)) => Err(ExecFailure::Failed(e)),
            Err(_) => Err(ExecFailure::Timeout(DbError::timeout(timeout))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_sqlstate() {
        let e = DbError::new("column \"x\" does not exist").with_sqlstate("42703");
        assert_eq!(e.to_string(), "column \"x\" does not exist (SQLSTATE 42703)");
    }

    #[tokio::test]
    async fn test_execute_bounded_timeout() {
        let exec = InMemoryExecutor::new().with_delay(Duration::from_millis(200));
        let res = execute_bounded(
            &exec,
            "SELECT 1",
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;
        match res {
            Err(ExecFailure::Timeout(e)) => assert!(e.message.contains("timed out")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
