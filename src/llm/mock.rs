//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序回放回复（文本 / 错误 / 延迟文本），记录每次收到的 prompt；脚本耗尽后返回默认回复
//! （默认是一个 finalize 决策），便于本地跑通整个编排流程。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::{Completion, LlmClient, TokenUsage};

const DEFAULT_REPLY: &str = r#"{"action": "finalize", "reasoning": "Mock script exhausted"}"#;

/// 脚本中的一条回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(ProviderError),
    /// 等待一段时间后返回文本（模拟慢调用）
    Delayed(Duration, String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// Mock 客户端：脚本回放
#[derive(Debug)]
pub struct MockLlmClient {
    model: String,
    script: Mutex<VecDeque<MockReply>>,
    default_reply: String,
    usage: TokenUsage,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(replies: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            model: "mock".to_string(),
            script: Mutex::new(replies.into_iter().collect()),
            default_reply: DEFAULT_REPLY.to_string(),
            usage: TokenUsage::new(10, 5),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 仅由文本组成的脚本
    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::scripted(texts.into_iter().map(|t| MockReply::Text(t.into())))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// 每次调用上报的 token 数
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// 已收到的 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.to_string());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();

        match next {
            Some(MockReply::Text(text)) => Ok(Completion::new(text, self.usage)),
            Some(MockReply::Fail(err)) => Err(err),
            Some(MockReply::Delayed(wait, text)) => {
                tokio::time::sleep(wait).await;
                Ok(Completion::new(text, self.usage))
            }
            None => Ok(Completion::new(self.default_reply.clone(), self.usage)),
        }
    }
}
