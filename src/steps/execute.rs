//! execute-sql：执行 current_sql，成功时合并结果，失败时记录错误上下文

use std::time::Instant;

use tracing::{debug, info, warn};

use super::{preview, StepContext};
use crate::core::{
    extract_location, AgentState, EngineError, ErrorContext, ExecutionResult, ExecutionStatus,
    StateDelta, ThoughtStatus, ThoughtStep,
};
use crate::db::{execute_bounded, DbError, ExecFailure};
use crate::sql::{merge_records, parse_rows};

pub async fn execute_sql(ctx: &StepContext<'_>, state: &AgentState) -> Result<StateDelta, EngineError> {
    let Some(sql) = state.current_sql.clone() else {
        return Ok(StateDelta::new().thought(
            ThoughtStep::new("execution", "执行SQL", ThoughtStatus::Skipped).with_output("没有待执行的SQL"),
        ));
    };

    if let Some(hit) = state.cached.as_ref().filter(|h| h.sql == sql) {
        debug!(key = %hit.key, "using cached execution result");
        let mut result = hit.execution_result.clone();
        result.from_cache = true;
        let merged = merge_records(&state.final_data, &hit.final_data, &ctx.settings.merge_key);
        let thought = ThoughtStep::new("execution", "使用缓存结果", ThoughtStatus::Completed)
            .with_input(preview(&sql, 200))
            .with_output(format!("{} 条记录", result.row_count));
        return Ok(StateDelta {
            executed: Some((sql, result)),
            final_data: Some(merged),
            current_step: Some(state.current_step + 1),
            current_sql: Some(None),
            ..StateDelta::default()
        }
        .clear_error()
        .thought(thought));
    }

    let started = Instant::now();
    let outcome = execute_bounded(ctx.executor, &sql, ctx.settings.sql_timeout, ctx.cancel).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let (status, err) = match outcome {
        Ok(rows) => {
            let data = parse_rows(rows);
            let result = ExecutionResult::success(data, elapsed_ms);
            let incoming = result.data.as_deref().unwrap_or_default();
            let merged = merge_records(&state.final_data, incoming, &ctx.settings.merge_key);
            info!(rows = result.row_count, merged = merged.len(), elapsed_ms, "SQL executed");
            let thought = ThoughtStep::new("execution", "执行SQL", ThoughtStatus::Completed)
                .with_input(preview(&sql, 200))
                .with_output(format!("{} 条记录，用时 {}ms", result.row_count, elapsed_ms));
            return Ok(StateDelta {
                executed: Some((sql, result)),
                final_data: Some(merged),
                current_step: Some(state.current_step + 1),
                current_sql: Some(None),
                ..StateDelta::default()
            }
            .clear_error()
            .thought(thought));
        }
        Err(ExecFailure::Cancelled) => return Err(EngineError::Cancelled),
        Err(ExecFailure::Timeout(e)) => (ExecutionStatus::Timeout, e),
        Err(ExecFailure::Failed(e)) => (ExecutionStatus::Error, e),
    };

    let raw = err.to_string();
    warn!(error = %raw, ?status, elapsed_ms, "SQL execution failed");
    let thought = ThoughtStep::new("execution", "执行SQL", ThoughtStatus::Failed)
        .with_input(preview(&sql, 200))
        .with_output(raw.clone());
    Ok(StateDelta {
        executed: Some((sql.clone(), ExecutionResult::failure(status, raw.clone(), elapsed_ms))),
        error_context: Some(Some(error_context(&err, &raw, sql, state.current_step))),
        last_error: Some(Some(raw)),
        current_sql: Some(None),
        ..StateDelta::default()
    }
    .thought(thought))
}

/// 后端提供的 SQLSTATE / position 优先，其次从文本解析
fn error_context(err: &DbError, raw: &str, sql: String, step: u32) -> ErrorContext {
    let location = extract_location(raw);
    ErrorContext {
        message: raw.to_string(),
        sql: Some(sql),
        sqlstate: err.sqlstate.clone().or(location.sqlstate),
        position: err.position.or(location.position),
        line: location.line,
        failed_at_step: step,
        suggestions: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheHit;
    use crate::core::Record;
    use crate::db::InMemoryExecutor;
    use crate::steps::testing::Fixture;
    use serde_json::json;

    fn record(name: &str) -> Record {
        let mut r = Record::new();
        r.insert("name".into(), json!(name));
        r
    }

    fn pending(sql: &str) -> AgentState {
        let mut state = AgentState::new("q", "c");
        state.current_sql = Some(sql.to_string());
        state
    }

    #[tokio::test]
    async fn test_success_merges_and_advances() {
        let fx = Fixture::new();
        fx.executor.on_json(
            "a_sight",
            json!([{"result": [{"name": "西湖", "level": "5A"}, {"name": "灵隐寺", "level": "4A"}]}]),
        );
        let mut state = pending("SELECT json_agg(a) AS result FROM a_sight a");
        state.final_data = vec![record("西湖")];
        state.apply(execute_sql(&fx.ctx(), &state).await.unwrap());

        assert_eq!(state.current_step, 1);
        assert_eq!(state.final_data.len(), 2);
        assert_eq!(state.final_data[0]["level"], json!("5A"));
        assert_eq!(state.execution_results[0].row_count, 2);
        assert!(state.current_sql.is_none());
        assert!(state.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_failure_keeps_step_and_records_context() {
        let fx = Fixture::new();
        fx.executor.on_error(
            "levl",
            DbError::new("column \"levl\" does not exist").with_sqlstate("42703"),
        );
        let mut state = pending("SELECT a.levl FROM a_sight a");
        state.apply(execute_sql(&fx.ctx(), &state).await.unwrap());

        assert_eq!(state.current_step, 0);
        assert_eq!(state.execution_results[0].status, ExecutionStatus::Error);
        let ctx = state.error_context.unwrap();
        assert_eq!(ctx.sqlstate.as_deref(), Some("42703"));
        assert_eq!(ctx.sql.as_deref(), Some("SELECT a.levl FROM a_sight a"));
        assert!(state.last_error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_timeout_status() {
        let mut fx = Fixture::new();
        fx.executor = InMemoryExecutor::new().with_delay(Duration::from_millis(200));
        fx.settings.sql_timeout = Duration::from_millis(20);
        let state = pending("SELECT 1");
        let delta = execute_sql(&fx.ctx(), &state).await.unwrap();
        let (_, result) = delta.executed.unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(delta.last_error.flatten().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_aborts() {
        let fx = Fixture::new();
        fx.cancel.cancel();
        let state = pending("SELECT 1");
        assert!(matches!(
            execute_sql(&fx.ctx(), &state).await,
            Err(EngineError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cached_result_skips_database() {
        let fx = Fixture::new();
        let sql = "SELECT a.name FROM a_sight a";
        let mut state = pending(sql);
        state.cached = Some(CacheHit {
            key: "k".into(),
            query: "q".into(),
            sql: sql.into(),
            execution_result: ExecutionResult::success(Some(vec![record("西湖")]), 5),
            final_data: vec![record("西湖")],
            similarity: 1.0,
            semantic: false,
        });
        state.apply(execute_sql(&fx.ctx(), &state).await.unwrap());

        assert!(fx.executor.executed().is_empty());
        assert!(state.execution_results[0].from_cache);
        assert_eq!(state.final_data.len(), 1);
        assert_eq!(state.current_step, 1);
    }

    #[tokio::test]
    async fn test_nothing_to_execute() {
        let fx = Fixture::new();
        let state = AgentState::new("q", "c");
        let delta = execute_sql(&fx.ctx(), &state).await.unwrap();
        assert!(delta.executed.is_none());
        assert_eq!(delta.thoughts[0].status, ThoughtStatus::Skipped);
    }
}
