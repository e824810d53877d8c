//! handle-error：对上一次失败分类，按策略表选择回退策略

use chrono::Utc;
use tracing::{info, warn};

use super::StepContext;
use crate::core::{
    AgentState, ErrorRecord, FallbackStrategy, StateDelta, ThoughtStatus, ThoughtStep,
};

pub fn handle_error(ctx: &StepContext<'_>, state: &AgentState) -> StateDelta {
    let Some(raw) = state.last_error.as_deref() else {
        return StateDelta::new().thought(
            ThoughtStep::new("error", "错误处理", ThoughtStatus::Skipped).with_output("没有待处理的错误"),
        );
    };

    let error_ctx = state.error_context.as_ref();
    let sql = error_ctx.and_then(|c| c.sql.as_deref());
    let sqlstate = error_ctx.and_then(|c| c.sqlstate.as_deref());

    let analysis = ctx.classifier.analyze(raw, sql, sqlstate);
    let error_type = analysis.error_type;
    let prior = state.prior_errors_of(error_type);
    let retry_count = state.retry_count + 1;
    let decision = ctx
        .policy
        .decide(error_type, prior, retry_count, state.max_retries);

    if decision.strategy == FallbackStrategy::Fail {
        warn!(%error_type, reason = %decision.reason, "error is not recoverable");
    } else {
        info!(%error_type, strategy = %decision.strategy, retry_count, "recovering from error");
    }

    let record = ErrorRecord {
        step: state.current_step,
        raw_error: raw.to_string(),
        classified_type: error_type,
        strategy: decision.strategy,
        retry_count,
        sql: sql.map(str::to_string),
        sqlstate: sqlstate.map(str::to_string),
        position: error_ctx.and_then(|c| c.position),
        at: Utc::now(),
    };

    let mut suggestions = analysis.suggestions;
    suggestions.extend(analysis.root_cause.factors);
    let error_context = error_ctx.cloned().map(|mut c| {
        c.suggestions = suggestions;
        c
    });

    let thought = ThoughtStep::new("error", "错误处理", ThoughtStatus::Completed)
        .with_input(raw.to_string())
        .with_output(format!(
            "type={} strategy={} retry={}/{}: {}",
            error_type, decision.strategy, retry_count, state.max_retries, decision.reason
        ));

    StateDelta {
        retry_count: Some(retry_count.min(state.max_retries)),
        fallback_strategy: Some(decision.strategy),
        error_record: Some(record),
        error_context: error_context.map(Some),
        should_continue: (decision.strategy == FallbackStrategy::Fail).then_some(false),
        backoff: decision.backoff,
        ..StateDelta::default()
    }
    .thought(thought)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorContext, ErrorType};
    use crate::steps::testing::Fixture;

    fn failing(raw: &str, sqlstate: Option<&str>) -> AgentState {
        let mut state = AgentState::new("q", "c");
        state.last_error = Some(raw.to_string());
        state.error_context = Some(ErrorContext {
            message: raw.to_string(),
            sql: Some("SELECT a.levl FROM a_sight a".into()),
            sqlstate: sqlstate.map(str::to_string),
            position: None,
            line: None,
            failed_at_step: 0,
            suggestions: vec![],
        });
        state
    }

    #[test]
    fn test_field_error_retries_sql() {
        let fx = Fixture::new();
        let mut state = failing("column \"levl\" does not exist", Some("42703"));
        let backoff = state.apply(handle_error(&fx.ctx(), &state));

        assert_eq!(state.retry_count, 1);
        assert_eq!(state.fallback_strategy, FallbackStrategy::RetrySql);
        assert_eq!(state.error_history[0].classified_type, ErrorType::Field);
        assert!(backoff.is_none());
        let suggestions = &state.error_context.unwrap().suggestions;
        assert!(suggestions.iter().any(|s| s.contains("levl")));
    }

    #[test]
    fn test_permission_fails_immediately() {
        let fx = Fixture::new();
        let mut state = failing("permission denied for table a_sight", None);
        state.apply(handle_error(&fx.ctx(), &state));
        assert_eq!(state.fallback_strategy, FallbackStrategy::Fail);
        assert!(!state.should_continue);
    }

    #[test]
    fn test_connection_error_requests_backoff() {
        let fx = Fixture::new();
        let mut state = failing("could not connect to server: Connection refused", None);
        let backoff = state.apply(handle_error(&fx.ctx(), &state));
        assert_eq!(state.fallback_strategy, FallbackStrategy::RetryExecution);
        assert_eq!(backoff, Some(std::time::Duration::from_secs(1)));
    }

    #[test]
    fn test_budget_exhaustion_fails() {
        let fx = Fixture::new();
        let mut state = failing("syntax error at or near \"FORM\"", Some("42601"));
        state.retry_count = state.max_retries;
        state.apply(handle_error(&fx.ctx(), &state));
        assert_eq!(state.retry_count, state.max_retries);
        assert_eq!(state.fallback_strategy, FallbackStrategy::Fail);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_resumed_run_ignores_previous_run_errors() {
        let fx = Fixture::new();
        let mut old = failing("unexpected response from server", None);
        old.apply(handle_error(&fx.ctx(), &old));
        assert_eq!(old.error_history[0].classified_type, ErrorType::Unknown);

        // 旧运行里同类错误已用完上限；新运行的第一次仍可重试
        let mut state = old.resume_with("灵隐寺的门票");
        state.last_error = Some("unexpected response from server".into());
        state.apply(handle_error(&fx.ctx(), &state));
        assert_eq!(state.error_history.len(), 2);
        assert_eq!(state.error_history[1].classified_type, ErrorType::Unknown);
        assert_eq!(state.fallback_strategy, FallbackStrategy::RetrySql);
    }
}
