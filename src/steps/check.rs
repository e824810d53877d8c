//! check-results：不调用 LLM 的规则判定，决定是否继续迭代
//!
//! 规则按顺序生效：
//! 1. SQL 重复导致细化结束 → 停止
//! 2. 仍有未恢复的错误 → 停止（预算耗尽时标记 Fail，并补记最后一次失败）
//! 3. 没有数据 → 未达迭代上限则继续
//! 4. 统计查询且至少一行 → 停止
//! 5. 本轮结果来自缓存 → 停止
//! 6. 完整性 ≥ completeness_stop → 停止
//! 7. 首轮完整性 < completeness_floor → 停止（视为源数据缺失）
//! 8. 其余：未达迭代上限则继续

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::{
    AgentState, EngineError, ErrorClassifier, ErrorRecord, FallbackStrategy, IntentType, StateDelta,
    ThoughtStatus, ThoughtStep,
};
use crate::sql::evaluate_completeness;
use crate::workflow::EngineSettings;

pub fn check_results(settings: &EngineSettings, classifier: &ErrorClassifier, state: &AgentState) -> StateDelta {
    let under_cap = state.current_step < state.max_iterations;
    let (should_continue, reason, fail) = decide(settings, state, under_cap);

    debug!(should_continue, reason = %reason, step = state.current_step, "results checked");
    let thought = ThoughtStep::new("check", "检查结果", ThoughtStatus::Completed).with_output(format!(
        "{}: {}",
        if should_continue { "继续" } else { "停止" },
        reason
    ));

    let delta = StateDelta {
        should_continue: Some(should_continue),
        fallback_strategy: fail.then_some(FallbackStrategy::Fail),
        ..StateDelta::default()
    };
    let delta = match budget_exhausted(classifier, state) {
        Some(record) => {
            let message = EngineError::RetryBudgetExhausted(state.max_retries).to_string();
            warn!(retries = state.retry_count, error_type = %record.classified_type, "{message}");
            StateDelta {
                error_record: Some(record),
                message: Some(message),
                ..delta
            }
        }
        None => delta,
    };
    delta.thought(thought)
}

/// 预算耗尽时最后一次失败没有经过 handle-error，这里补一条 Fail 记录
fn budget_exhausted(classifier: &ErrorClassifier, state: &AgentState) -> Option<ErrorRecord> {
    let raw = state.last_error.as_deref()?;
    if state.retry_budget_left() || state.fallback_strategy == FallbackStrategy::Fail {
        return None;
    }
    let error_ctx = state.error_context.as_ref();
    let sql = error_ctx.and_then(|c| c.sql.clone());
    let sqlstate = error_ctx.and_then(|c| c.sqlstate.clone());
    Some(ErrorRecord {
        step: state.current_step,
        raw_error: raw.to_string(),
        classified_type: classifier.classify_with_code(raw, sqlstate.as_deref()),
        strategy: FallbackStrategy::Fail,
        retry_count: state.retry_count,
        sql,
        sqlstate,
        position: error_ctx.and_then(|c| c.position),
        at: Utc::now(),
    })
}

fn decide(settings: &EngineSettings, state: &AgentState, under_cap: bool) -> (bool, String, bool) {
    if state.refinement_exhausted {
        return (false, "生成的SQL与历史重复".to_string(), false);
    }
    if let Some(err) = &state.last_error {
        let exhausted = !state.retry_budget_left() || state.fallback_strategy == FallbackStrategy::Fail;
        return (false, format!("错误未恢复: {err}"), exhausted);
    }
    if state.final_data.is_empty() {
        return (under_cap, "没有查询到数据".to_string(), false);
    }
    if state.intent.intent_type == IntentType::Summary {
        return (false, format!("统计查询已返回 {} 行", state.final_data.len()), false);
    }
    if state.execution_results.last().is_some_and(|r| r.from_cache) {
        return (false, "结果来自缓存".to_string(), false);
    }

    let completeness = evaluate_completeness(&state.final_data, &settings.required_fields);
    let score = completeness.score;
    if score >= settings.completeness_stop {
        return (false, format!("完整性 {score:.2} 已满足"), false);
    }
    if state.current_step == 1 && score < settings.completeness_floor {
        return (false, format!("首轮完整性 {score:.2} 过低，数据源缺失"), false);
    }
    let missing: Vec<&str> = completeness.missing_fields.iter().map(String::as_str).collect();
    (
        under_cap,
        format!("完整性 {score:.2}，缺少字段: {}", missing.join(", ")),
        false,
    )
}
