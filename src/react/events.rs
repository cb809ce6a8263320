//! 编排过程事件：阶段、决策、工具调用、降级与用量，可序列化为 JSON 供日志或前端展示

use serde::Serialize;

use crate::core::AgentPhase;

/// 单步过程事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PhaseStarted { phase: AgentPhase },
    /// 推理回合计数
    Iteration {
        phase: AgentPhase,
        iteration: usize,
        max_iterations: usize,
    },
    Decision {
        phase: AgentPhase,
        action: String,
        reasoning: String,
    },
    ToolCall {
        index: usize,
        tool: String,
        params: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    ToolResult {
        index: usize,
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 阶段以兜底值收场
    Fallback { stage: String, reason: String },
    Usage {
        stage: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        retries: u32,
    },
    Completed { artifacts: usize, iterations: usize },
}
