//! 编排器构建器：由 AppConfig + 工具注册表 + 模型客户端组装 Orchestrator
//!
//! 同一个构建器产出的 StageRunner 共享一个 ResilientCaller，编排器与流水线因此共用同一个并发闸门。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{Orchestrator, ResilientCaller};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, PricingTable};
use crate::pipeline::StageRunner;
use crate::react::{AgentEvent, DefaultPrompts, PromptSet};
use crate::tools::{SyncTool, Tool, ToolDispatcher, ToolRegistry};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider is mock, using Mock LLM");
            Arc::new(MockLlmClient::new().with_model(cfg.llm.model.clone()))
        }
    }
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: ToolRegistry,
    prompts: Arc<dyn PromptSet>,
    caller: Option<ResilientCaller>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    cancel: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: ToolRegistry::new(),
            prompts: Arc::new(DefaultPrompts),
            caller: None,
            events: None,
            cancel: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.registry.register(tool);
        self
    }

    pub fn with_blocking_tool(mut self, tool: impl SyncTool) -> Self {
        self.registry.register_blocking(tool);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptSet>) -> Self {
        self.prompts = prompts;
        self
    }

    /// 使用外部共享的调用器（与其它编排器 / 流水线共用闸门）
    pub fn with_caller(mut self, caller: ResilientCaller) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// 按配置创建（或复用）共享调用器
    pub fn caller(&mut self) -> ResilientCaller {
        let config = &self.config;
        self.caller
            .get_or_insert_with(|| {
                ResilientCaller::new(config.resilience.max_concurrent, config.retry_config())
            })
            .clone()
    }

    /// 与编排器共享闸门的 StageRunner（用于流水线阶段）
    pub fn stage_runner(&mut self, llm: Arc<dyn LlmClient>) -> StageRunner {
        let pricing: PricingTable = self.config.pricing_table();
        StageRunner::new(llm, self.caller(), Arc::new(pricing))
    }

    pub fn build(mut self, llm: Arc<dyn LlmClient>) -> Orchestrator {
        let runner = self.stage_runner(llm);
        let dispatcher = ToolDispatcher::with_timeout(
            Arc::new(self.registry),
            Duration::from_secs(self.config.tools.tool_timeout_secs),
        );
        tracing::info!(
            tools = ?dispatcher.tool_names(),
            max_concurrent = runner.caller().max_concurrent(),
            "orchestrator ready"
        );

        let mut orchestrator = Orchestrator::new(
            runner,
            Arc::new(dispatcher),
            self.prompts,
            self.config.agent_settings(),
        );
        if let Some(tx) = self.events {
            orchestrator = orchestrator.with_events(tx);
        }
        if let Some(token) = self.cancel {
            orchestrator = orchestrator.with_cancel_token(token);
        }
        orchestrator
    }
}
