//! 认知层：决策契约、结构化输出解析、prompt 模板、过程事件

pub mod decision;
pub mod events;
pub mod parser;
pub mod prompts;

pub use decision::{decision_schema_json, ArtifactList, Decision, ToolCall, PARSE_FAILURE_REASON};
pub use events::AgentEvent;
pub use parser::{parse_structured, strip_code_fences, Contract, Parsed, StructuredResponseParser};
pub use prompts::{DefaultPrompts, PromptSet, ReasoningContext};
