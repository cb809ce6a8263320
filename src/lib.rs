//! Consensus - 面向限流外部服务的多步编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、弹性调用（并发闸门 + 限流重试）、运行状态、编排器
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Mock）、用量与计价
//! - **observability**: 日志初始化、过程事件日志
//! - **pipeline**: 阶段流水线（门控 / 变换）与批处理
//! - **react**: 决策契约、结构化输出解析、prompt 模板、过程事件
//! - **tools**: 工具注册表与并行调度器

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod react;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, RunResult};
