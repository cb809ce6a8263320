//! Echo 工具（测试 / 本地演示用）

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::{Tool, ToolParams};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Params: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: &ToolParams) -> Result<String, ToolError> {
        params
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ToolError::invalid_params("echo", "missing string field `text`"))
    }
}
