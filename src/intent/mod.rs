//! 查询意图分析：优先 LLM 结构化输出，失败时回退到关键词规则

pub mod keywords;

use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{Intent, IntentSource, IntentType, MatchMode};
use crate::llm::{complete_bounded, LlmClient, LlmError};
use crate::prompts;

pub use keywords::{detect_match_mode, matched_keywords, KeywordScores, SPATIAL_KEYWORDS, SUMMARY_KEYWORDS};

/// LLM 意图分析的回复格式
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct IntentReply {
    /// "query" 或 "summary"
    pub intent_type: IntentType,
    pub is_spatial: bool,
    /// 0.0 - 1.0
    pub confidence: f64,
    #[serde(default)]
    pub keywords_matched: Vec<String>,
    /// 分析推理过程
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_clear")]
    pub is_query_clear: bool,
}

fn default_clear() -> bool {
    true
}

impl IntentReply {
    fn into_intent(self, match_mode: MatchMode) -> Intent {
        Intent {
            intent_type: self.intent_type,
            is_spatial: self.is_spatial,
            confidence: self.confidence.clamp(0.0, 1.0),
            match_mode,
            keywords: self.keywords_matched,
            description: self.description,
            source: IntentSource::Llm,
            is_clear: self.is_query_clear,
        }
    }
}

/// 解析 LLM 回复
pub fn parse_reply(text: &str) -> Result<IntentReply, LlmError> {
    let json = prompts::extract_json(text)
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in intent reply".to_string()))?;
    serde_json::from_str(json).map_err(|e| LlmError::InvalidResponse(e.to_string()))
}

/// 意图分析结果；`llm_error` 记录回退原因
#[derive(Debug, Clone)]
pub struct IntentOutcome {
    pub intent: Intent,
    pub llm_error: Option<LlmError>,
}

/// LLM 意图分析，失败时回退到关键词分析
///
/// `requested` 为调用方显式指定的匹配方式；请求 Exact 或查询文本要求精确时使用 Exact。
pub async fn analyze(
    llm: &dyn LlmClient,
    query: &str,
    requested: MatchMode,
    timeout: Duration,
    cancel: &CancellationToken,
) -> IntentOutcome {
    let match_mode = if requested == MatchMode::Exact {
        MatchMode::Exact
    } else {
        detect_match_mode(query)
    };

    let messages = prompts::analyze_intent(query, &prompts::format_instructions::<IntentReply>());
    let reply = complete_bounded(llm, &messages, timeout, cancel)
        .await
        .and_then(|text| parse_reply(&text));

    match reply {
        Ok(reply) => {
            let intent = reply.into_intent(match_mode);
            info!(
                intent_type = intent.intent_type.as_str(),
                spatial = intent.is_spatial,
                confidence = intent.confidence,
                "LLM intent analysis"
            );
            IntentOutcome {
                intent,
                llm_error: None,
            }
        }
        Err(e) => {
            warn!(error = %e, "LLM intent analysis failed, falling back to keywords");
            let mut intent = keywords::analyze(query);
            intent.match_mode = match_mode;
            IntentOutcome {
                intent,
                llm_error: Some(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};

    #[tokio::test]
    async fn test_llm_reply_used() {
        let llm = ScriptedLlmClient::new();
        llm.push_ok(
            r#"```json
{"intent_type": "summary", "is_spatial": false, "confidence": 0.9, "keywords_matched": ["多少"], "description": "计数", "is_query_clear": true}
```"#,
        );
        let out = analyze(
            &llm,
            "浙江省有多少个5A景区",
            MatchMode::Fuzzy,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(out.llm_error.is_none());
        assert_eq!(out.intent.intent_type, IntentType::Summary);
        assert_eq!(out.intent.source, IntentSource::Llm);
    }

    #[tokio::test]
    async fn test_fallback_on_llm_failure() {
        let out = analyze(
            &MockLlmClient::unavailable(),
            "统计浙江省有多少个4A景区",
            MatchMode::Exact,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(out.llm_error.is_some());
        assert_eq!(out.intent.source, IntentSource::Keyword);
        assert_eq!(out.intent.intent_type, IntentType::Summary);
        assert_eq!(out.intent.match_mode, MatchMode::Exact);
    }

    #[tokio::test]
    async fn test_fallback_on_garbage() {
        let out = analyze(
            &MockLlmClient::replying("I think it is a query"),
            "查询杭州的景区",
            MatchMode::Fuzzy,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(out.llm_error, Some(LlmError::InvalidResponse(_))));
        assert_eq!(out.intent.intent_type, IntentType::Query);
    }
}
