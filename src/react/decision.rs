//! 结构化输出契约：推理决策（Decision）与产物列表（ArtifactList）
//!
//! 决策 JSON：`{"action": "use_tool" | "use_tools" | "finalize", "tool_name", "tool_params",
//! "tools": [{"tool_name", "tool_params"}], "reasoning"}`。
//! 缺字段、未知 action、类型不符都是 Schema 错误，由解析器换成该契约的 invalid_format 兜底值。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::core::{Artifact, ParseError};
use crate::react::Contract;
use crate::tools::ToolParams;

/// 语法失败（或调用失败）时的决策兜底原因
pub const PARSE_FAILURE_REASON: &str = "JSON parse error, finalizing";

/// 批量调用中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_params: ToolParams,
}

impl ToolCall {
    fn from_object(obj: &Map<String, Value>) -> Result<Self, ParseError> {
        let tool_name = obj
            .get("tool_name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| ParseError::Schema("missing required field `tool_name`".to_string()))?;
        let tool_params = match obj.get("tool_params") {
            Some(Value::Object(params)) => params.clone(),
            Some(Value::Null) | None => {
                return Err(ParseError::Schema(
                    "missing required field `tool_params`".to_string(),
                ))
            }
            Some(_) => {
                return Err(ParseError::Schema(
                    "`tool_params` must be an object".to_string(),
                ))
            }
        };
        Ok(Self {
            tool_name: tool_name.to_string(),
            tool_params,
        })
    }
}

/// 推理决策
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    #[serde(rename = "use_tool")]
    UseSingleTool {
        tool_name: String,
        tool_params: ToolParams,
        reasoning: String,
    },
    #[serde(rename = "use_tools")]
    UseManyTools { tools: Vec<ToolCall>, reasoning: String },
    Finalize { reasoning: String },
}

impl Decision {
    pub fn finalize(reasoning: impl Into<String>) -> Self {
        Self::Finalize {
            reasoning: reasoning.into(),
        }
    }

    /// 语法失败兜底：结束当前阶段
    pub fn parse_failure() -> Self {
        Self::finalize(PARSE_FAILURE_REASON)
    }

    pub fn reasoning(&self) -> &str {
        match self {
            Decision::UseSingleTool { reasoning, .. }
            | Decision::UseManyTools { reasoning, .. }
            | Decision::Finalize { reasoning } => reasoning,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Decision::UseSingleTool { .. } => "use_tool",
            Decision::UseManyTools { .. } => "use_tools",
            Decision::Finalize { .. } => "finalize",
        }
    }

    pub fn is_finalize(&self) -> bool {
        matches!(self, Decision::Finalize { .. })
    }
}

impl Contract for Decision {
    const NAME: &'static str = "decision";

    fn from_value(value: Value) -> Result<Self, ParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseError::Schema("expected a JSON object".to_string()))?;
        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Schema("missing required field `action`".to_string()))?;
        let reasoning = obj
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match action {
            "use_tool" => {
                let call = ToolCall::from_object(obj)?;
                Ok(Decision::UseSingleTool {
                    tool_name: call.tool_name,
                    tool_params: call.tool_params,
                    reasoning,
                })
            }
            "use_tools" => {
                let entries = obj
                    .get("tools")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        ParseError::Schema("`use_tools` requires a `tools` array".to_string())
                    })?;
                if entries.is_empty() {
                    return Err(ParseError::Schema("`tools` must not be empty".to_string()));
                }
                let tools = entries
                    .iter()
                    .map(|entry| {
                        entry
                            .as_object()
                            .ok_or_else(|| {
                                ParseError::Schema("`tools` entries must be objects".to_string())
                            })
                            .and_then(ToolCall::from_object)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Decision::UseManyTools { tools, reasoning })
            }
            "finalize" => Ok(Decision::Finalize { reasoning }),
            other => Err(ParseError::Schema(format!("unknown action `{other}`"))),
        }
    }

    fn invalid_format(detail: &str) -> Self {
        Self::finalize(format!("Invalid response format: {detail}"))
    }
}

/// 产物列表：模型输出的 JSON 数组（也接受 `{"artifacts": [...]}` / `{"recommendations": [...]}`）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ArtifactList(pub Vec<Artifact>);

impl ArtifactList {
    /// 单条占位产物
    pub fn placeholder(description: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self(vec![json!({
            "name": "Error",
            "description": description.into(),
            "reasoning": reasoning.into(),
        })])
    }

    pub fn into_inner(self) -> Vec<Artifact> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Contract for ArtifactList {
    const NAME: &'static str = "artifacts";

    fn from_value(value: Value) -> Result<Self, ParseError> {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut obj) => match ["artifacts", "recommendations"]
                .iter()
                .find_map(|key| obj.remove(*key))
            {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(ParseError::Schema(
                        "expected a JSON array of artifacts".to_string(),
                    ))
                }
            },
            _ => {
                return Err(ParseError::Schema(
                    "expected a JSON array of artifacts".to_string(),
                ))
            }
        };
        if let Some(pos) = items.iter().position(|item| !item.is_object()) {
            return Err(ParseError::Schema(format!("artifact {pos} is not an object")));
        }
        Ok(Self(items))
    }

    fn invalid_format(detail: &str) -> Self {
        Self::placeholder(
            format!("Could not parse artifacts: {detail}"),
            "Invalid response format",
        )
    }
}

/// 决策 JSON 格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct DecisionFormat {
    /// use_tool（单个工具）、use_tools（并行多个工具）或 finalize（结束当前阶段）
    pub action: ActionFormat,
    /// action 为 use_tool 时必填
    pub tool_name: Option<String>,
    /// action 为 use_tool 时必填
    pub tool_params: Option<HashMap<String, Value>>,
    /// action 为 use_tools 时必填，非空
    pub tools: Option<Vec<ToolCallFormat>>,
    /// 本步推理说明
    pub reasoning: String,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
#[serde(rename_all = "snake_case")]
enum ActionFormat {
    UseTool,
    UseTools,
    Finalize,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    pub tool_name: String,
    pub tool_params: HashMap<String, Value>,
}

/// 决策的 JSON Schema 字符串，可拼入 prompt
pub fn decision_schema_json() -> String {
    let schema = schema_for!(DecisionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
