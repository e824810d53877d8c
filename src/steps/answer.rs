//! generate-answer：终止步骤，写入 status / answer / message

use tracing::{info, warn};

use super::{abort_if_cancelled, StepContext};
use crate::core::{
    AgentState, EngineError, FallbackStrategy, IntentType, RunStatus, StateDelta, ThoughtStatus,
    ThoughtStep,
};
use crate::llm::complete_bounded;
use crate::prompts;

pub const SUCCESS_MESSAGE: &str = "查询成功";
pub const EMPTY_MESSAGE: &str = "查询完成，但未找到匹配结果";

pub async fn generate_answer(ctx: &StepContext<'_>, state: &AgentState) -> Result<StateDelta, EngineError> {
    let failed = state.fallback_strategy == FallbackStrategy::Fail
        || (state.last_error.is_some() && state.final_data.is_empty());
    if failed {
        let raw = state.last_error.clone().unwrap_or_else(|| "查询失败".to_string());
        warn!(error = %raw, "run finished with error");
        // check-results 已写入的终止原因（如重试预算耗尽）优先于原始错误
        let message = if state.message.is_empty() { raw.clone() } else { state.message.clone() };
        return Ok(StateDelta {
            status: Some(RunStatus::Error),
            answer: Some(format!("抱歉，查询过程中出现错误，未能得到结果。错误信息：{raw}")),
            message: Some(message),
            should_continue: Some(false),
            ..StateDelta::default()
        }
        .thought(ThoughtStep::new("answer", "生成回答", ThoughtStatus::Failed)));
    }

    let messages = prompts::answer(state, ctx.settings.answer_sample_size);
    let (answer, status) = match complete_bounded(ctx.llm, &messages, ctx.settings.llm_timeout, ctx.cancel).await {
        Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), ThoughtStatus::Completed),
        Ok(_) => (template_answer(state), ThoughtStatus::Skipped),
        Err(e) => {
            abort_if_cancelled(&e)?;
            warn!(error = %e, "answer generation failed, using template");
            (template_answer(state), ThoughtStatus::Skipped)
        }
    };

    let message = if state.final_data.is_empty() {
        EMPTY_MESSAGE
    } else {
        SUCCESS_MESSAGE
    };
    info!(rows = state.final_data.len(), steps = state.current_step, "answer generated");

    Ok(StateDelta {
        status: Some(RunStatus::Success),
        answer: Some(answer),
        message: Some(message.to_string()),
        should_continue: Some(false),
        ..StateDelta::default()
    }
    .thought(ThoughtStep::new("answer", "生成回答", status)))
}

/// LLM 不可用时的模板回答
fn template_answer(state: &AgentState) -> String {
    let data = &state.final_data;
    if data.is_empty() {
        return "没有找到符合条件的结果。".to_string();
    }
    if state.intent.intent_type == IntentType::Summary {
        let first = serde_json::to_string(&data[0]).unwrap_or_default();
        return format!("统计结果：{first}");
    }
    let names: Vec<&str> = data
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.as_str()))
        .take(5)
        .collect();
    if names.is_empty() {
        format!("共找到 {} 条结果。", data.len())
    } else {
        format!("共找到 {} 条结果，包括：{} 等。", data.len(), names.join("、"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use crate::prompts::ANSWER_TASK;
    use crate::steps::testing::Fixture;
    use serde_json::json;

    fn with_names(names: &[&str]) -> AgentState {
        let mut state = AgentState::new("杭州的5A景区", "c");
        state.final_data = names
            .iter()
            .map(|n| {
                let mut r = Record::new();
                r.insert("name".into(), json!(n));
                r
            })
            .collect();
        state
    }

    #[tokio::test]
    async fn test_llm_answer() {
        let fx = Fixture::new();
        fx.llm.when(ANSWER_TASK, "杭州共有两个5A景区。");
        let mut state = with_names(&["西湖", "千岛湖"]);
        state.apply(generate_answer(&fx.ctx(), &state).await.unwrap());
        assert_eq!(state.status, RunStatus::Success);
        assert_eq!(state.answer, "杭州共有两个5A景区。");
        assert_eq!(state.message, SUCCESS_MESSAGE);
    }

    #[tokio::test]
    async fn test_template_when_llm_fails() {
        let fx = Fixture::new();
        fx.llm.fail_when(ANSWER_TASK, "timeout");
        let state = with_names(&["西湖", "千岛湖"]);
        let delta = generate_answer(&fx.ctx(), &state).await.unwrap();
        let answer = delta.answer.unwrap();
        assert!(answer.contains("2 条"));
        assert!(answer.contains("西湖、千岛湖"));
    }

    #[tokio::test]
    async fn test_empty_result_message() {
        let fx = Fixture::new();
        fx.llm.when(ANSWER_TASK, "没有找到。");
        let delta = generate_answer(&fx.ctx(), &with_names(&[])).await.unwrap();
        assert_eq!(delta.status, Some(RunStatus::Success));
        assert_eq!(delta.message.as_deref(), Some(EMPTY_MESSAGE));
    }

    #[tokio::test]
    async fn test_fail_reports_raw_error_without_llm() {
        let fx = Fixture::new();
        let mut state = with_names(&[]);
        state.fallback_strategy = FallbackStrategy::Fail;
        state.last_error = Some("permission denied for table a_sight".into());
        let delta = generate_answer(&fx.ctx(), &state).await.unwrap();
        assert_eq!(delta.status, Some(RunStatus::Error));
        assert_eq!(delta.message.as_deref(), Some("permission denied for table a_sight"));
        assert_eq!(fx.llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_budget_message_kept_and_raw_error_in_answer() {
        let fx = Fixture::new();
        let mut state = with_names(&[]);
        state.fallback_strategy = FallbackStrategy::Fail;
        state.last_error = Some("syntax error at or near \"WHERE\"".into());
        state.message = "Retry budget exhausted after 5 retries".into();
        let delta = generate_answer(&fx.ctx(), &state).await.unwrap();
        assert_eq!(delta.message.as_deref(), Some("Retry budget exhausted after 5 retries"));
        assert!(delta.answer.unwrap().contains("syntax error"));
    }
}
