//! 错误分类：Provider / 调用 / 解析 / 工具 / 状态
//!
//! Provider 错误在调用边界就带上 `ProviderErrorKind`；只有无法给出结构化类型的后端才退回到
//! `ProviderErrorKind::sniff` 的消息匹配。ResilientCaller 仅依据 kind 决定是否重试。

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Provider 错误类型（决定是否可重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// 限流（429 / rate limit），可退避重试
    Throttled,
    /// 调用超时；默认不重试，除非调用方显式开启
    Timeout,
    /// 鉴权失败
    Auth,
    /// 配额耗尽（即便带 429 也不重试）
    Quota,
    /// 网络/传输层故障
    Transport,
    Other,
}

impl ProviderErrorKind {
    /// 消息兜底分类：仅用于不暴露结构化错误类型的后端
    pub fn sniff(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("insufficient_quota")
            || lower.contains("exceeded your current quota")
            || lower.contains("quota exceeded")
        {
            Self::Quota
        } else if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
            Self::Throttled
        } else if lower.contains("401")
            || lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("incorrect api key")
        {
            Self::Auth
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else {
            Self::Other
        }
    }
}

/// 外部 Provider（模型或能力后端）返回的错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Provider 以结构化方式（如 Retry-After 头）给出的等待时间
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// 按消息内容推断 kind
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ProviderErrorKind::sniff(&message), message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Throttled, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    pub fn is_throttled(&self) -> bool {
        self.kind == ProviderErrorKind::Throttled
    }
}

/// ResilientCaller 的失败结果
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// 不可重试的错误，首次出现即返回
    #[error("{0}")]
    Provider(ProviderError),

    /// 重试次数耗尽，携带最后一次错误
    #[error("{source} (gave up after {attempts} attempts)")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

impl CallError {
    /// 底层 Provider 错误（若有）
    pub fn provider(&self) -> &ProviderError {
        match self {
            CallError::Provider(e) | CallError::Exhausted { source: e, .. } => e,
        }
    }

    /// 失败前实际尝试的次数
    pub fn attempts(&self) -> u32 {
        match self {
            CallError::Provider(_) => 1,
            CallError::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// 重试次数（尝试次数 - 1），计入 UsageRecord
    pub fn retries(&self) -> u32 {
        self.attempts().saturating_sub(1)
    }
}

/// 结构化输出解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// 文本不是合法的结构化对象（采样噪声，值得对上游重试一次）
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// 结构合法但缺少必需字段（契约违规，不重试）
    #[error("Schema violation: {0}")]
    Schema(String),
}

/// 能力（工具）调用错误；在批量调度中被捕获为带错误标记的结果，不会中断兄弟任务
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool {0} not found")]
    NotFound(String),

    #[error("Invalid parameters for {tool}: {reason}")]
    InvalidParams { tool: String, reason: String },

    #[error("Tool {tool} failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error("Tool {0} timed out")]
    Timeout(String),
}

impl ToolError {
    pub fn invalid_params(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Execution {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// 阶段降级原因：阶段以兜底值收场时随结果一起返回，不向上抛出
#[derive(Error, Debug, Clone)]
pub enum StageFailure {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// 运行状态错误：完成后不可再写
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Run state is sealed after completion")]
    Sealed,
}
