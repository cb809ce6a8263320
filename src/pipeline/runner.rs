//! StageRunner：一次阶段调用 = 弹性模型调用 + 计价 +（可选）结构化解析
//!
//! 所有阶段共享同一个 ResilientCaller（同一个并发闸门），因此整个运行 / 批次的在途模型调用数有统一上限。

use std::sync::Arc;

use crate::core::{CallError, ResilientCaller, StageFailure};
use crate::llm::{LlmClient, PricingTable, UsageRecord};
use crate::pipeline::StageOutcome;
use crate::react::{Contract, Parsed, StructuredResponseParser};

#[derive(Clone)]
pub struct StageRunner {
    llm: Arc<dyn LlmClient>,
    caller: ResilientCaller,
    pricing: Arc<PricingTable>,
    parser: StructuredResponseParser,
}

impl StageRunner {
    pub fn new(llm: Arc<dyn LlmClient>, caller: ResilientCaller, pricing: Arc<PricingTable>) -> Self {
        Self {
            llm,
            caller,
            pricing,
            parser: StructuredResponseParser::new(),
        }
    }

    pub fn caller(&self) -> &ResilientCaller {
        &self.caller
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    /// 一次弹性模型调用，返回文本与用量（retries = 限流重试次数）
    pub async fn complete(&self, label: &str, prompt: &str) -> Result<(String, UsageRecord), CallError> {
        let llm = &self.llm;
        let (completion, attempts) = self.caller.call(label, || llm.complete(prompt)).await?;
        let cost = self.pricing.cost(llm.model(), &completion.usage);
        let usage = UsageRecord::new(completion.usage, cost, attempts.saturating_sub(1));
        tracing::debug!(
            label,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost = usage.cost,
            attempts,
            "model call done"
        );
        Ok((completion.text, usage))
    }

    /// 结构化回合：调用 + 解析，失败时返回 `fallback`（或契约的 invalid_format）
    pub async fn structured<C: Contract>(&self, label: &str, prompt: &str, fallback: C) -> Parsed<C> {
        self.parser
            .resolve(label, || self.complete(label, prompt), fallback)
            .await
    }

    /// 自由文本回合：调用失败时输出空串并带上失败原因
    pub async fn text_turn(&self, label: &str, prompt: &str) -> StageOutcome<String> {
        match self.complete(label, prompt).await {
            Ok((text, usage)) => StageOutcome::proceed(text, usage),
            Err(e) => {
                tracing::warn!(label, error = %e, "text stage failed, continuing with empty output");
                let usage = UsageRecord {
                    retries: e.retries(),
                    ..UsageRecord::default()
                };
                StageOutcome::proceed(String::new(), usage)
                    .with_failure(Some(StageFailure::Call(e)))
            }
        }
    }
}
