//! generate-sql：每次调用产出一条 SQL
//!
//! 分支优先级：
//! 1. 首轮且缓存命中：复用缓存的 SQL
//! 2. RetryExecution：原样重新执行执行失败的那条 SQL
//! 3. SimplifyQuery：收紧顶层 LIMIT，不调用 LLM
//! 4. RetrySql：带错误上下文让 LLM 修复
//! 5. 首轮：按意图与查询初次生成
//! 6. 其余：针对缺失字段 / 遗漏记录的补充查询
//!
//! 产出的 SQL 依次经过：去代码块、只读校验、别名补全、重复检测。

use tracing::{debug, info, warn};

use super::{abort_if_cancelled, preview, StepContext};
use crate::cache::CacheHit;
use crate::core::{
    extract_location, AgentState, EngineError, ErrorContext, FallbackStrategy, StateDelta,
    ThoughtStatus, ThoughtStep,
};
use crate::llm::complete_bounded;
use crate::prompts;
use crate::sql::{evaluate_completeness, guard_read_only, is_duplicate, repair_aliases, simplify, strip_code_fences};

pub async fn generate_sql(ctx: &StepContext<'_>, state: &AgentState) -> Result<StateDelta, EngineError> {
    if let Some(hit) = lookup_cache(ctx, state).await {
        let thought = ThoughtStep::new("sql", "复用缓存的SQL", ThoughtStatus::Completed).with_output(
            if hit.semantic {
                format!("语义命中 (相似度 {:.3}): {}", hit.similarity, hit.query)
            } else {
                "精确命中".to_string()
            },
        );
        return Ok(StateDelta {
            current_sql: Some(Some(hit.sql.clone())),
            cached: Some(Some(hit)),
            ..StateDelta::default()
        }
        .clear_error()
        .thought(thought));
    }

    // 只有执行失败的 SQL 才会被重新执行或简化；生成阶段的失败没有 SQL，改走 LLM 生成
    let failed_sql = state.error_context.as_ref().and_then(|c| c.sql.clone());

    match (state.fallback_strategy, failed_sql, state.error_context.as_ref()) {
        (FallbackStrategy::RetryExecution, Some(sql), _) => {
            info!("re-executing previous SQL after connection error");
            // 重新执行不参与重复检测
            Ok(StateDelta {
                current_sql: Some(Some(sql)),
                ..StateDelta::default()
            }
            .clear_error()
            .thought(ThoughtStep::new("sql", "重新执行失败的SQL", ThoughtStatus::Completed)))
        }
        (FallbackStrategy::SimplifyQuery, Some(sql), _) => {
            let simplified = simplify(&sql, ctx.settings.simplify_limit);
            debug!(limit = ctx.settings.simplify_limit, "simplified SQL after timeout");
            Ok(finalize(state, &simplified, "简化查询（限制返回行数）"))
        }
        (FallbackStrategy::RetrySql, failed, Some(error_context)) => {
            let messages = prompts::repair_sql(state, failed.as_deref().unwrap_or(""), error_context);
            call_llm(ctx, state, messages, "修复SQL").await
        }
        _ if state.current_step == 0 => {
            call_llm(ctx, state, prompts::generate_sql(state), "生成SQL").await
        }
        _ => {
            let missing: Vec<String> = evaluate_completeness(&state.final_data, &ctx.settings.required_fields)
                .missing_fields
                .into_iter()
                .collect();
            call_llm(ctx, state, prompts::followup_sql(state, &missing), "生成补充查询SQL").await
        }
    }
}

async fn lookup_cache(ctx: &StepContext<'_>, state: &AgentState) -> Option<CacheHit> {
    let cache = ctx.cache?;
    let eligible = state.current_step == 0
        && state.fallback_strategy == FallbackStrategy::None
        && state.validation_feedback.is_none()
        && state.sql_history.is_empty()
        && state.cached.is_none();
    if !eligible {
        return None;
    }
    cache.lookup(&state.query, &state.intent).await
}

async fn call_llm(
    ctx: &StepContext<'_>,
    state: &AgentState,
    messages: Vec<crate::llm::Message>,
    action: &str,
) -> Result<StateDelta, EngineError> {
    match complete_bounded(ctx.llm, &messages, ctx.settings.llm_timeout, ctx.cancel).await {
        Ok(text) => Ok(finalize(state, &text, action)),
        Err(e) => {
            abort_if_cancelled(&e)?;
            warn!(error = %e, action, "SQL generation failed");
            let message = format!("SQL generation failed: {e}");
            Ok(rejected(state, message.clone(), None)
                .thought(ThoughtStep::new("sql", action, ThoughtStatus::Failed).with_output(message)))
        }
    }
}

/// 生成失败或被拒绝：记录错误，交给 handle-error 分类
fn rejected(state: &AgentState, message: String, sql: Option<String>) -> StateDelta {
    let location = extract_location(&message);
    StateDelta {
        current_sql: Some(None),
        last_error: Some(Some(message.clone())),
        error_context: Some(Some(ErrorContext {
            message,
            sql,
            sqlstate: location.sqlstate,
            position: location.position,
            line: location.line,
            failed_at_step: state.current_step,
            suggestions: Vec::new(),
        })),
        fallback_strategy: Some(FallbackStrategy::None),
        ..StateDelta::default()
    }
}

/// 对候选 SQL 做清洗与校验
fn finalize(state: &AgentState, raw: &str, action: &str) -> StateDelta {
    let sql = strip_code_fences(raw);
    if sql.is_empty() {
        let message = "LLM returned empty SQL".to_string();
        return rejected(state, message.clone(), None)
            .thought(ThoughtStep::new("sql", action, ThoughtStatus::Failed).with_output(message));
    }

    if let Err(message) = guard_read_only(&sql) {
        warn!(%message, "generated SQL rejected");
        return rejected(state, message.clone(), Some(sql.clone())).thought(
            ThoughtStep::new("sql", action, ThoughtStatus::Failed)
                .with_input(sql)
                .with_output(message),
        );
    }

    let sql = match repair_aliases(&sql) {
        Ok(repair) => {
            if repair.changed() {
                info!(added = ?repair.added, "missing table aliases inserted");
            }
            repair.sql
        }
        Err(e) => {
            let message = e.to_string();
            warn!(%message, "alias check rejected generated SQL");
            return rejected(state, message.clone(), Some(sql.clone())).thought(
                ThoughtStep::new("sql", action, ThoughtStatus::Failed)
                    .with_input(sql)
                    .with_output(message),
            );
        }
    };

    if is_duplicate(&sql, &state.sql_history) {
        info!("generated SQL duplicates history, stopping refinement");
        return StateDelta {
            current_sql: Some(None),
            should_continue: Some(false),
            refinement_exhausted: Some(true),
            fallback_strategy: Some(FallbackStrategy::None),
            ..StateDelta::default()
        }
        .thought(
            ThoughtStep::new("sql", action, ThoughtStatus::Skipped)
                .with_input(sql)
                .with_output("与历史SQL重复，停止迭代"),
        );
    }

    StateDelta {
        current_sql: Some(Some(sql.clone())),
        ..StateDelta::default()
    }
    .clear_error()
    .thought(ThoughtStep::new("sql", action, ThoughtStatus::Completed).with_output(preview(&sql, 500)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, QueryCache};
    use crate::core::{ExecutionResult, Intent, Record};
    use crate::prompts::{FOLLOWUP_TASK, GENERATE_TASK, REPAIR_TASK};
    use crate::steps::testing::Fixture;
    use serde_json::json;

    fn failed_state(strategy: FallbackStrategy, sql: &str) -> AgentState {
        let mut state = AgentState::new("杭州的5A景区", "c");
        state.sql_history.push(sql.to_string());
        state
            .execution_results
            .push(ExecutionResult::failure(crate::core::ExecutionStatus::Error, "boom", 1));
        state.last_error = Some("column \"levl\" does not exist".into());
        state.error_context = Some(ErrorContext {
            message: "column \"levl\" does not exist".into(),
            sql: Some(sql.to_string()),
            sqlstate: Some("42703".into()),
            position: None,
            line: None,
            failed_at_step: 0,
            suggestions: vec![],
        });
        state.fallback_strategy = strategy;
        state
    }

    #[tokio::test]
    async fn test_initial_generation_strips_fences_and_repairs_alias() {
        let fx = Fixture::new();
        fx.llm.when(GENERATE_TASK, "```sql\nSELECT a.name WHERE a.level = '5A'\n```");
        let state = AgentState::new("杭州的5A景区", "c");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        let sql = delta.current_sql.flatten().unwrap();
        assert!(sql.contains("FROM a_sight a"));
        assert_eq!(delta.last_error, Some(None));
    }

    #[tokio::test]
    async fn test_write_statement_rejected_as_permission() {
        let fx = Fixture::new();
        fx.llm.when(GENERATE_TASK, "DROP TABLE a_sight");
        let state = AgentState::new("删除所有景区", "c");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(delta.current_sql, Some(None));
        let err = delta.last_error.flatten().unwrap();
        assert!(err.starts_with("permission denied"));
    }

    #[tokio::test]
    async fn test_unknown_alias_fails_closed() {
        let fx = Fixture::new();
        fx.llm.when(GENERATE_TASK, "SELECT x.name FROM a_sight a");
        let state = AgentState::new("q", "c");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(
            delta.last_error.flatten().as_deref(),
            Some("missing FROM-clause entry for table \"x\"")
        );
    }

    #[tokio::test]
    async fn test_retry_sql_uses_repair_prompt() {
        let fx = Fixture::new();
        fx.llm.when(REPAIR_TASK, "SELECT a.name, a.level FROM a_sight a");
        let state = failed_state(FallbackStrategy::RetrySql, "SELECT a.levl FROM a_sight a");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(
            delta.current_sql.flatten().as_deref(),
            Some("SELECT a.name, a.level FROM a_sight a")
        );
        assert_eq!(delta.fallback_strategy, Some(FallbackStrategy::None));
        let prompt = &fx.llm.prompts()[0];
        assert!(prompt.contains("SELECT a.levl FROM a_sight a"));
        assert!(prompt.contains("42703"));
    }

    #[tokio::test]
    async fn test_simplify_does_not_call_llm() {
        let fx = Fixture::new();
        let state = failed_state(FallbackStrategy::SimplifyQuery, "SELECT a.name FROM a_sight a;");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(
            delta.current_sql.flatten().as_deref(),
            Some("SELECT a.name FROM a_sight a\nLIMIT 50")
        );
        assert_eq!(fx.llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_execution_reuses_sql_without_duplicate_check() {
        let fx = Fixture::new();
        let state = failed_state(FallbackStrategy::RetryExecution, "SELECT a.name FROM a_sight a");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(
            delta.current_sql.flatten().as_deref(),
            Some("SELECT a.name FROM a_sight a")
        );
        assert!(delta.refinement_exhausted.is_none());
        assert_eq!(fx.llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_execution_without_failed_sql_regenerates() {
        let fx = Fixture::new();
        fx.llm.when(FOLLOWUP_TASK, "SELECT t.name, t.\"门票\" FROM tourist_spot t");
        let mut state = AgentState::new("q", "c");
        state.sql_history.push("SELECT a.name FROM a_sight a".into());
        state.execution_results.push(ExecutionResult::success(None, 1));
        state.current_step = 1;
        state.last_error = Some("SQL generation failed: connection refused".into());
        state.error_context = Some(ErrorContext {
            message: "SQL generation failed: connection refused".into(),
            sql: None,
            sqlstate: None,
            position: None,
            line: None,
            failed_at_step: 1,
            suggestions: vec![],
        });
        state.fallback_strategy = FallbackStrategy::RetryExecution;

        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        let sql = delta.current_sql.flatten().unwrap();
        assert_ne!(sql, "SELECT a.name FROM a_sight a");
        assert!(sql.contains("tourist_spot t"));
        assert_eq!(fx.llm.count_matching(FOLLOWUP_TASK), 1);
    }

    #[tokio::test]
    async fn test_duplicate_sql_stops_refinement() {
        let fx = Fixture::new();
        fx.llm.when(FOLLOWUP_TASK, "SELECT a.name\n  FROM a_sight a;");
        let mut state = AgentState::new("q", "c");
        state.sql_history.push("SELECT a.name FROM a_sight a".into());
        state.execution_results.push(ExecutionResult::success(None, 1));
        state.current_step = 1;
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(delta.current_sql, Some(None));
        assert_eq!(delta.should_continue, Some(false));
        assert_eq!(delta.refinement_exhausted, Some(true));
    }

    #[tokio::test]
    async fn test_followup_prompt_lists_missing_fields() {
        let fx = Fixture::new();
        fx.llm.when(FOLLOWUP_TASK, "SELECT t.name, t.\"门票\" FROM tourist_spot t");
        let mut state = AgentState::new("q", "c");
        state.sql_history.push("SELECT a.name FROM a_sight a".into());
        state.execution_results.push(ExecutionResult::success(None, 1));
        state.current_step = 1;
        let mut r = Record::new();
        r.insert("name".into(), json!("西湖"));
        state.final_data = vec![r];
        generate_sql(&fx.ctx(), &state).await.unwrap();
        assert!(fx.llm.prompts()[0].contains("门票"));
    }

    #[tokio::test]
    async fn test_llm_failure_recorded_as_error() {
        let fx = Fixture::new();
        fx.llm.fail_when(GENERATE_TASK, "connection refused");
        let state = AgentState::new("q", "c");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(delta.current_sql, Some(None));
        assert!(delta.last_error.flatten().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_cache_hit_on_first_step() {
        let mut fx = Fixture::new();
        let cache = QueryCache::in_memory(CacheSettings::default());
        let intent = Intent::default();
        cache
            .put(
                "杭州的5A景区",
                &intent,
                "SELECT a.name FROM a_sight a",
                &ExecutionResult::success(Some(vec![Record::new()]), 3),
                &[Record::new()],
            )
            .await
            .unwrap();
        fx.cache = Some(cache);

        let state = AgentState::new("杭州的5A景区", "c");
        let delta = generate_sql(&fx.ctx(), &state).await.unwrap();
        assert_eq!(
            delta.current_sql.flatten().as_deref(),
            Some("SELECT a.name FROM a_sight a")
        );
        assert!(delta.cached.flatten().is_some());
        assert_eq!(fx.llm.calls(), 0);
    }
}
