//! 阶段流水线：StageRunner、门控 / 变换阶段、线性流水线与批处理

pub mod flow;
pub mod gate;
pub mod runner;
pub mod stage;

pub use flow::{BatchSummary, Pipeline, PipelineReport, StageRecord};
pub use gate::{GateStage, GateVerdict};
pub use runner::StageRunner;
pub use stage::{CapabilityStage, PromptStage, Stage, StageContext, StageOutcome};
