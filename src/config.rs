//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读默认 TOML 文件，再读显式指定的文件，最后用环境变量 `CONSENSUS__*` 覆盖
//! （双下划线表示嵌套，如 `CONSENSUS__AGENT__RESEARCH_ITERATIONS=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentSettings, RetryConfig};
use crate::llm::{ModelPricing, PricingTable};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub resilience: ResilienceSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    /// [[pricing]]：按模型计价（USD / 1M tokens）
    pub pricing: Vec<PricingEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；openai 需要 OPENAI_API_KEY
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

/// 单次模型调用超时（秒）；0 表示不限
#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

/// [resilience] 段：并发闸门与重试
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceSection {
    /// 最大尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 全局在途调用上限
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub retry_on_timeout: bool,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_concurrent: default_max_concurrent(),
            retry_on_timeout: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    5
}

/// [agent] 段：推理循环上限
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_iterations")]
    pub research_iterations: usize,
    #[serde(default = "default_iterations")]
    pub critique_iterations: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            research_iterations: default_iterations(),
            critique_iterations: default_iterations(),
        }
    }
}

fn default_iterations() -> usize {
    20
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input: f64,
    pub output: f64,
}

impl AppConfig {
    pub fn retry_config(&self) -> RetryConfig {
        let cfg = RetryConfig::default()
            .with_max_attempts(self.resilience.max_attempts)
            .with_base_delay(Duration::from_millis(self.resilience.base_delay_ms))
            .with_retry_on_timeout(self.resilience.retry_on_timeout);
        match self.llm.timeouts.request {
            0 => cfg,
            secs => cfg.with_timeout(Duration::from_secs(secs)),
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            research_iterations: self.agent.research_iterations,
            critique_iterations: self.agent.critique_iterations,
        }
    }

    pub fn pricing_table(&self) -> PricingTable {
        self.pricing
            .iter()
            .map(|p| {
                (
                    p.model.clone(),
                    ModelPricing {
                        input: p.input,
                        output: p.output,
                    },
                )
            })
            .collect()
    }
}

pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONSENSUS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
