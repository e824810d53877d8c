//! Mock / 脚本化 LLM 客户端（用于测试，无需 API）
//!
//! - MockLlmClient：固定回复，或固定失败（模拟 LLM 不可用）
//! - ScriptedLlmClient：按提示词关键字或先进先出队列给出回复，并记录收到的提示词

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message};

/// Mock 客户端：总是返回同一结果
#[derive(Debug, Clone)]
pub struct MockLlmClient {
    reply: Result<String, String>,
}

impl MockLlmClient {
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            reply: Ok(text.into()),
        }
    }

    /// 每次调用都失败
    pub fn unavailable() -> Self {
        Self {
            reply: Err("mock llm unavailable".to_string()),
        }
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::unavailable()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.reply.clone().map_err(LlmError::Backend)
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<Result<String, String>>,
}

/// 脚本化客户端
///
/// 匹配顺序：先按注册顺序找第一个提示词包含 needle 的规则（规则的最后一条回复会被重复使用），
/// 再从队列取，都没有则返回错误。
#[derive(Default)]
pub struct ScriptedLlmClient {
    rules: Mutex<Vec<Rule>>,
    queue: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用前等待（用于超时 / 取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        lock(&self.queue).push_back(Ok(text.into()));
    }

    pub fn push_err(&self, err: impl Into<String>) {
        lock(&self.queue).push_back(Err(err.into()));
    }

    /// 提示词包含 needle 时回复 text
    pub fn when(&self, needle: &str, text: impl Into<String>) -> &Self {
        self.add_rule(needle, Ok(text.into()));
        self
    }

    /// 提示词包含 needle 时返回错误
    pub fn fail_when(&self, needle: &str, err: impl Into<String>) -> &Self {
        self.add_rule(needle, Err(err.into()));
        self
    }

    fn add_rule(&self, needle: &str, reply: Result<String, String>) {
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.replies.push_back(reply),
            None => rules.push(Rule {
                needle: needle.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
    }

    /// 已收到的提示词（每次调用所有消息内容拼接）
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    /// 包含 needle 的调用次数
    pub fn count_matching(&self, needle: &str) -> usize {
        lock(&self.prompts).iter().filter(|p| p.contains(needle)).count()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_reply(&self, prompt: &str) -> Result<String, String> {
        {
            let mut rules = lock(&self.rules);
            if let Some(rule) = rules.iter_mut().find(|r| prompt.contains(&r.needle)) {
                if rule.replies.len() > 1 {
                    if let Some(reply) = rule.replies.pop_front() {
                        return reply;
                    }
                }
                if let Some(reply) = rule.replies.front() {
                    return reply.clone();
                }
            }
        }
        lock(&self.queue)
            .pop_front()
            .unwrap_or_else(|| Err("scripted llm: no reply left".to_string()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        lock(&self.prompts).push(prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_reply(&prompt).map_err(LlmError::Backend)
    }
}
