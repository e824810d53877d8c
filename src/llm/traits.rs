//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容端点 / Mock）实现 LlmClient。客户端内部不做重试；
//! 超时与取消由 [`complete_bounded`] 在调用侧统一施加。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::Message;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回首个候选的文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 累计 token 用量；不统计的后端返回 None
    fn token_usage(&self) -> Option<TokenUsage> {
        None
    }
}

/// 累计 token 用量快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM call cancelled")]
    Cancelled,

    #[error("LLM backend error: {0}")]
    Backend(String),

    #[error("LLM returned unusable output: {0}")]
    InvalidResponse(String),
}

/// 单次有界等待：超时或取消令牌触发时放弃调用
pub async fn complete_bounded(
    llm: &dyn LlmClient,
    messages: &[Message],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        res = tokio::time::timeout(timeout, llm.complete(messages)) => match res {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LlmError::Timeout(timeout)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_bounded_timeout() {
        let llm = ScriptedLlmClient::new().with_delay(Duration::from_millis(200));
        llm.push_ok("late");
        let err = complete_bounded(
            &llm,
            &[Message::user("hi")],
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_bounded_cancel() {
        let llm = ScriptedLlmClient::new().with_delay(Duration::from_secs(5));
        llm.push_ok("never");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = complete_bounded(&llm, &[Message::user("hi")], Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Cancelled);
    }

    #[tokio::test]
    async fn test_bounded_backend_error() {
        let llm = ScriptedLlmClient::new();
        llm.push_err("rate limited");
        let err = complete_bounded(
            &llm,
            &[Message::user("hi")],
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, LlmError::Backend("rate limited".to_string()));
    }
}
