//! validate-results：可选的 LLM 语义校验；任何失败都放行，不阻塞流程

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use super::{abort_if_cancelled, StepContext};
use crate::core::{
    AgentState, EngineError, FallbackStrategy, StateDelta, ThoughtStatus, ThoughtStep,
    ValidationFeedback,
};
use crate::llm::{complete_bounded, LlmError};
use crate::prompts;

/// LLM 校验的回复格式
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ValidationReply {
    /// 结果是否回答了用户的问题
    pub is_valid: bool,
    /// 校验结论
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub issues: Vec<String>,
    /// 对下一次 SQL 生成的建议
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// 0.0 - 1.0
    #[serde(default)]
    pub confidence: f64,
}

pub fn parse_reply(text: &str) -> Result<ValidationReply, LlmError> {
    let json = prompts::extract_json(text)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in validation reply".to_string()))?;
    serde_json::from_str(json).map_err(|e| LlmError::InvalidResponse(e.to_string()))
}

fn pass(reason: &str) -> StateDelta {
    StateDelta {
        should_continue: Some(false),
        validation_feedback: Some(None),
        ..StateDelta::default()
    }
    .thought(ThoughtStep::new("validation", "校验结果", ThoughtStatus::Skipped).with_output(reason))
}

pub async fn validate_results(ctx: &StepContext<'_>, state: &AgentState) -> Result<StateDelta, EngineError> {
    let settings = ctx.settings;
    if !settings.enable_validation {
        return Ok(pass("校验已关闭"));
    }
    if state.final_data.is_empty() {
        return Ok(pass("没有数据可校验"));
    }
    if state.last_error.is_some() || state.fallback_strategy == FallbackStrategy::Fail {
        return Ok(pass("存在未恢复的错误"));
    }
    if state.refinement_exhausted {
        return Ok(pass("细化已结束"));
    }
    if state.validation_retry_count >= settings.max_validation_retries {
        return Ok(pass("已达到校验重试上限"));
    }

    let format = prompts::format_instructions::<ValidationReply>();
    let messages = prompts::validate_results(state, settings.validation_sample_size, &format);
    let reply = match complete_bounded(ctx.llm, &messages, settings.llm_timeout, ctx.cancel).await {
        Ok(text) => parse_reply(&text),
        Err(e) => Err(e),
    };

    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            abort_if_cancelled(&e)?;
            warn!(error = %e, "validation unavailable, passing results through");
            return Ok(pass(&format!("校验失败，直接放行: {e}")));
        }
    };

    if reply.is_valid {
        info!(confidence = reply.confidence, "results validated");
        return Ok(StateDelta {
            should_continue: Some(false),
            validation_feedback: Some(None),
            ..StateDelta::default()
        }
        .thought(
            ThoughtStep::new("validation", "校验结果", ThoughtStatus::Completed)
                .with_output(format!("通过 (confidence {:.2}) {}", reply.confidence, reply.message)),
        ));
    }

    info!(issues = reply.issues.len(), "validation requested another pass");
    let thought = ThoughtStep::new("validation", "校验结果", ThoughtStatus::Completed)
        .with_output(format!("未通过: {} [{}]", reply.message, reply.issues.join("; ")));
    Ok(StateDelta {
        should_continue: Some(true),
        validation_retry_count: Some(state.validation_retry_count + 1),
        validation_feedback: Some(Some(ValidationFeedback {
            message: reply.message,
            issues: reply.issues,
            suggestions: reply.suggestions,
            confidence: reply.confidence.clamp(0.0, 1.0),
        })),
        ..StateDelta::default()
    }
    .thought(thought))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use crate::prompts::VALIDATE_TASK;
    use crate::steps::testing::Fixture;
    use serde_json::json;

    fn with_data() -> AgentState {
        let mut state = AgentState::new("杭州的5A景区及门票", "c");
        let mut r = Record::new();
        r.insert("name".into(), json!("西湖"));
        state.final_data = vec![r];
        state.sql_history.push("SELECT a.name FROM a_sight a".into());
        state
    }

    #[tokio::test]
    async fn test_invalid_reply_attaches_feedback() {
        let fx = Fixture::new();
        fx.llm.when(
            VALIDATE_TASK,
            r#"{"is_valid": false, "message": "缺少门票", "issues": ["无门票字段"], "suggestions": ["关联 tourist_spot"], "confidence": 0.8}"#,
        );
        let mut state = with_data();
        state.apply(validate_results(&fx.ctx(), &state).await.unwrap());
        assert!(state.should_continue);
        assert_eq!(state.validation_retry_count, 1);
        assert_eq!(state.validation_feedback.unwrap().suggestions, vec!["关联 tourist_spot"]);
    }

    #[tokio::test]
    async fn test_valid_reply_stops() {
        let fx = Fixture::new();
        fx.llm.when(VALIDATE_TASK, r#"{"is_valid": true, "message": "ok", "confidence": 0.9}"#);
        let delta = validate_results(&fx.ctx(), &with_data()).await.unwrap();
        assert_eq!(delta.should_continue, Some(false));
        assert_eq!(delta.validation_feedback, Some(None));
    }

    #[tokio::test]
    async fn test_llm_failure_passes_through() {
        let fx = Fixture::new();
        fx.llm.fail_when(VALIDATE_TASK, "503");
        let delta = validate_results(&fx.ctx(), &with_data()).await.unwrap();
        assert_eq!(delta.should_continue, Some(false));
        assert_eq!(delta.thoughts[0].status, ThoughtStatus::Skipped);

        fx.llm.when(VALIDATE_TASK, "not json");
        let delta = validate_results(&fx.ctx(), &with_data()).await.unwrap();
        assert_eq!(delta.should_continue, Some(false));
    }

    #[tokio::test]
    async fn test_retry_limit_skips_llm() {
        let fx = Fixture::new();
        let mut state = with_data();
        state.validation_retry_count = 1;
        validate_results(&fx.ctx(), &state).await.unwrap();
        assert_eq!(fx.llm.calls(), 0);
    }
}
