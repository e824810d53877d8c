//! analyze-intent / enhance-query

use super::{abort_if_cancelled, StepContext};
use crate::core::{AgentState, EngineError, IntentSource, IntentType, StateDelta, ThoughtStatus, ThoughtStep};
use crate::intent;
use crate::prompts::{SPATIAL_HINT, SUMMARY_HINT};

pub async fn analyze_intent(ctx: &StepContext<'_>, state: &AgentState) -> Result<StateDelta, EngineError> {
    let outcome = intent::analyze(
        ctx.llm,
        &state.query,
        state.intent.match_mode,
        ctx.settings.llm_timeout,
        ctx.cancel,
    )
    .await;
    if let Some(err) = &outcome.llm_error {
        abort_if_cancelled(err)?;
    }

    let i = &outcome.intent;
    let source = match i.source {
        IntentSource::Llm => "LLM",
        IntentSource::Keyword => "关键词",
    };
    let thought = ThoughtStep::new("intent", "分析查询意图", ThoughtStatus::Completed)
        .with_input(state.query.clone())
        .with_output(format!(
            "{}分析: type={} spatial={} confidence={:.2} match={:?}",
            source,
            i.intent_type.as_str(),
            i.is_spatial,
            i.confidence,
            i.match_mode
        ));

    Ok(StateDelta {
        intent: Some(outcome.intent),
        ..StateDelta::default()
    }
    .thought(thought))
}

/// 按意图在查询后附加提示；不调用 LLM
pub fn enhance_query(state: &AgentState) -> StateDelta {
    let mut enhanced = state.query.trim().to_string();
    let mut hints = Vec::new();
    if state.intent.is_spatial {
        enhanced.push_str("\n\n");
        enhanced.push_str(SPATIAL_HINT);
        hints.push("spatial");
    }
    if state.intent.intent_type == IntentType::Summary {
        enhanced.push_str("\n\n");
        enhanced.push_str(SUMMARY_HINT);
        hints.push("summary");
    }

    let status = if hints.is_empty() {
        ThoughtStatus::Skipped
    } else {
        ThoughtStatus::Completed
    };
    let thought = ThoughtStep::new("enhance", "增强查询", status).with_output(if hints.is_empty() {
        "无需增强".to_string()
    } else {
        format!("附加提示: {}", hints.join(", "))
    });

    StateDelta {
        enhanced_query: Some(enhanced),
        ..StateDelta::default()
    }
    .thought(thought)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Intent, MatchMode};
    use crate::steps::testing::Fixture;

    #[tokio::test]
    async fn test_analyze_falls_back_to_keywords() {
        let fx = Fixture::new();
        fx.llm.fail_when(crate::prompts::INTENT_TASK, "503 service unavailable");
        let state = AgentState::new("统计浙江省有多少个5A景区", "c").with_match_mode(MatchMode::Exact);
        let delta = analyze_intent(&fx.ctx(), &state).await.unwrap();
        let intent = delta.intent.unwrap();
        assert_eq!(intent.intent_type, IntentType::Summary);
        assert_eq!(intent.source, IntentSource::Keyword);
        assert_eq!(intent.match_mode, MatchMode::Exact);
    }

    #[tokio::test]
    async fn test_analyze_cancelled_aborts() {
        let fx = Fixture::new();
        fx.cancel.cancel();
        let state = AgentState::new("q", "c");
        assert!(matches!(
            analyze_intent(&fx.ctx(), &state).await,
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn test_enhance_appends_hints() {
        let mut state = AgentState::new("西湖附近有多少个景区", "c");
        state.intent = Intent {
            intent_type: IntentType::Summary,
            is_spatial: true,
            ..Intent::default()
        };
        let enhanced = enhance_query(&state).enhanced_query.unwrap();
        assert!(enhanced.starts_with("西湖附近有多少个景区"));
        assert!(enhanced.contains(SPATIAL_HINT));
        assert!(enhanced.contains(SUMMARY_HINT));

        let plain = AgentState::new("杭州的景区", "c");
        assert_eq!(enhance_query(&plain).enhanced_query.unwrap(), "杭州的景区");
    }
}
