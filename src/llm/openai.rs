//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。API 错误在这里就归类为
//! ProviderErrorKind，下游只看 kind。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{ProviderError, ProviderErrorKind};
use crate::llm::{Completion, LlmClient, TokenUsage};

/// OpenAI 兼容客户端：单条 user 消息，取首条 choice 的 content
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

/// API 错误归类：结构化的 ApiError 用 type + message 判定，其它错误退回消息匹配
fn classify(err: OpenAIError) -> ProviderError {
    match &err {
        OpenAIError::ApiError(api) => {
            let hint = format!(
                "{} {}",
                api.r#type.as_deref().unwrap_or_default(),
                api.message
            );
            ProviderError::new(ProviderErrorKind::sniff(&hint), api.message.clone())
        }
        _ => {
            let message = err.to_string();
            let kind = match ProviderErrorKind::sniff(&message) {
                ProviderErrorKind::Other => ProviderErrorKind::Transport,
                kind => kind,
            };
            ProviderError::new(kind, message)
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, e.to_string()))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![ChatCompletionRequestMessage::User(message)])
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Other, e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or_default();

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Completion::new(text, usage))
    }
}
