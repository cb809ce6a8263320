//! 核心编排层：错误分类、弹性调用、运行状态、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod resilient;
pub mod state;

pub use builder::{create_llm_from_config, OrchestratorBuilder};
pub use error::{
    CallError, ParseError, ProviderError, ProviderErrorKind, StageFailure, StateError, ToolError,
};
pub use orchestrator::{AgentSettings, Orchestrator, PhaseReport, RunResult};
pub use resilient::{backoff_delay, parse_retry_hint, retry_wait, ResilientCaller, RetryConfig, MAX_RETRY_WAIT};
pub use state::{AgentPhase, Artifact, OrchestrationState};
