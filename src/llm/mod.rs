//! LLM 层：模型调用抽象、用量与计价、实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;
pub mod usage;

pub use mock::{MockLlmClient, MockReply};
pub use openai::OpenAiClient;
pub use traits::{Completion, LlmClient};
pub use usage::{ModelPricing, PricingTable, TokenUsage, UsageRecord, UsageTotals};
