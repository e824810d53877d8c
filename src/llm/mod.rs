//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod chat;
pub mod embedding;
pub mod message;
pub mod mock;
pub mod traits;

use std::sync::Arc;

pub use chat::ChatClient;
pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use message::{Message, Role};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use traits::{complete_bounded, LlmClient, LlmError, TokenUsage};

use crate::config::LlmSection;

/// 按配置的 provider 创建 LLM 客户端：deepseek / openai（任意兼容端点）/ mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "deepseek" => Arc::new(
            ChatClient::deepseek(Some(cfg.model.as_str()), cfg.api_key.as_deref())
                .with_temperature(cfg.temperature),
        ),
        "mock" => {
            tracing::warn!("using mock LLM client, every call fails");
            Arc::new(MockLlmClient::unavailable())
        }
        other => {
            if other != "openai" {
                tracing::warn!(provider = other, "unknown LLM provider, treating as openai-compatible");
            }
            Arc::new(
                ChatClient::openai(cfg.base_url.as_deref(), &cfg.model, cfg.api_key.as_deref())
                    .with_temperature(cfg.temperature),
            )
        }
    }
}
