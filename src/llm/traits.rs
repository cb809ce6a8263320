//! LLM 客户端抽象
//!
//! 引擎只依赖 `complete(prompt) -> (text, usage)`；传输/配额等故障以带 kind 的 ProviderError 返回，
//! 由 ResilientCaller 决定是否重试。

use async_trait::async_trait;
use serde::Serialize;

use crate::core::ProviderError;
use crate::llm::TokenUsage;

/// 单次模型调用结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 模型名（用于计价表查找）
    fn model(&self) -> &str;

    /// 非流式完成
    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError>;
}
