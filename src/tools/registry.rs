//! 工具注册表
//!
//! 所有能力实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找。
//! 同步（阻塞）实现走 SyncTool，注册时包一层 spawn_blocking 适配，不占用异步工作线程。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;

/// 工具参数：JSON 对象
pub type ToolParams = serde_json::Map<String, Value>;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（决策 JSON 中的 "tool_name"）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, params: &ToolParams) -> Result<String, ToolError>;
}

/// 阻塞式工具（本地计算、同步 SDK 等）
pub trait SyncTool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn execute_blocking(&self, params: &ToolParams) -> Result<String, ToolError>;
}

/// SyncTool -> Tool：在阻塞线程池上执行
struct BlockingAdapter<T>(Arc<T>);

#[async_trait]
impl<T: SyncTool> Tool for BlockingAdapter<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn parameters_schema(&self) -> Value {
        self.0.parameters_schema()
    }

    async fn execute(&self, params: &ToolParams) -> Result<String, ToolError> {
        let tool = Arc::clone(&self.0);
        let params = params.clone();
        let name = self.0.name().to_string();
        tokio::task::spawn_blocking(move || tool.execute_blocking(&params))
            .await
            .map_err(|e| ToolError::execution(name, format!("blocking task failed: {e}")))?
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_blocking(&mut self, tool: impl SyncTool) {
        self.register(BlockingAdapter(Arc::new(tool)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn execute(&self, name: &str, params: &ToolParams) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(params).await
    }

    /// 按名称排序
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表（按名称排序），用于 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        list.sort();
        list
    }

    /// "- name: description" 逐行拼接
    pub fn describe(&self) -> String {
        self.tool_descriptions()
            .iter()
            .map(|(name, desc)| format!("- {name}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 已注册工具的 schema JSON（名称、描述、参数）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
