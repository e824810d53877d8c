//! 向量嵌入：语义缓存按查询向量的余弦相似度匹配

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::chat::env_key;
use crate::llm::LlmError;

/// 嵌入提供方
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// 提供方标识，随向量写入缓存；标识不同的向量之间不做比较
    fn name(&self) -> &str;
}

/// OpenAI 兼容的 /embeddings 端点
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    name: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            name: format!("openai:{model}"),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse("cannot embed empty text".to_string()));
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| LlmError::Backend(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| LlmError::Backend(e.to_string()))?;
        response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("empty embedding".to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 远程嵌入需要 API Key（参数或 OPENAI_API_KEY），没有时返回 None，语义缓存随之关闭
pub fn create_embedder_from_config(
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Option<Arc<dyn EmbeddingProvider>> {
    let Some(key) = api_key
        .filter(|k| !k.is_empty())
        .map(String::from)
        .or_else(|| env_key(&["OPENAI_API_KEY"]))
    else {
        tracing::warn!("embedding.provider = openai but no API key, semantic cache disabled");
        return None;
    };
    Some(Arc::new(OpenAiEmbedder::new(base_url, model, &key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_carries_model() {
        let e = OpenAiEmbedder::new(Some("http://localhost:1"), "text-embedding-3-small", "k");
        assert_eq!(e.name(), "openai:text-embedding-3-small");
    }

    #[tokio::test]
    async fn test_empty_text_rejected_locally() {
        let e = OpenAiEmbedder::new(Some("http://localhost:1"), "m", "k");
        assert!(matches!(e.embed("  ").await, Err(LlmError::InvalidResponse(_))));
    }
}
