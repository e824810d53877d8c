//! OpenAI 兼容的对话补全客户端（async_openai）
//!
//! DeepSeek 与 OpenAI 共用同一套协议，只在 base_url、模型名与 API Key 来源上不同。

use std::sync::atomic::{AtomicU64, Ordering};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use tracing::debug;

use crate::llm::{LlmClient, LlmError, Message, Role, TokenUsage};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

pub(crate) fn env_key(names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| std::env::var(n).ok().filter(|v| !v.is_empty()))
}

pub struct ChatClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl ChatClient {
    /// 任意 OpenAI 兼容端点；未给出 api_key 时读取 OPENAI_API_KEY
    pub fn openai(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let key = api_key
            .map(String::from)
            .or_else(|| env_key(&["OPENAI_API_KEY"]))
            .unwrap_or_default();
        Self::with_endpoint(base_url, model, key)
    }

    /// DeepSeek；Key 依次取参数、DEEPSEEK_API_KEY、OPENAI_API_KEY，模型为空时取 DEEPSEEK_MODEL
    pub fn deepseek(model: Option<&str>, api_key: Option<&str>) -> Self {
        let key = api_key
            .map(String::from)
            .or_else(|| env_key(&["DEEPSEEK_API_KEY", "OPENAI_API_KEY"]))
            .unwrap_or_default();
        let model = model
            .filter(|m| !m.is_empty())
            .map(String::from)
            .or_else(|| env_key(&["DEEPSEEK_MODEL"]))
            .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
        Self::with_endpoint(Some(DEEPSEEK_BASE_URL), &model, key)
    }

    fn with_endpoint(base_url: Option<&str>, model: &str, api_key: String) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            // SQL 生成需要稳定输出
            temperature: 0.0,
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn to_request_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| {
            let content = m.content.clone();
            let built = match m.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()
                    .map(ChatCompletionRequestMessage::System),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()
                    .map(ChatCompletionRequestMessage::User),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()
                    .map(ChatCompletionRequestMessage::Assistant),
            };
            built.map_err(|e| LlmError::Backend(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl LlmClient for ChatClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(to_request_messages(messages)?)
            .build()
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Backend(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.prompt_tokens
                .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
            debug!(
                model = %self.model,
                prompt = usage.prompt_tokens,
                completion = usage.completion_tokens,
                "chat completion"
            );
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("empty completion".to_string()))
    }

    fn token_usage(&self) -> Option<TokenUsage> {
        Some(TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        })
    }
}
