//! 工具调度器
//!
//! 持有 ToolRegistry 与单次调用超时。单个调用：超时 / 工具错误 / panic 都被捕获为带错误标记的
//! ToolResult；批量调用：全部并发执行，结果按请求下标排序后返回，某个调用失败不影响兄弟调用。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::{ToolParams, ToolRegistry};

/// 一次调度请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRequest {
    /// 在批次中的下标
    pub index: usize,
    pub name: String,
    pub params: ToolParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Completed,
    Failed,
}

/// 一次调度结果：成功文本或错误
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub index: usize,
    pub name: String,
    pub params: ToolParams,
    pub payload: Result<String, ToolError>,
    pub duration: Duration,
}

impl ToolResult {
    pub fn status(&self) -> ToolStatus {
        match self.payload {
            Ok(_) => ToolStatus::Completed,
            Err(_) => ToolStatus::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.payload.is_ok()
    }

    /// 写入研究数据 / 上下文的文本；失败时为 "Error: ..."（未注册工具为 "Tool X not found"）
    pub fn observation(&self) -> String {
        match &self.payload {
            Ok(text) => text.clone(),
            Err(e @ ToolError::NotFound(_)) => e.to_string(),
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// 工具调度器
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(Arc::new(registry), Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 调用单个工具
    pub async fn dispatch(&self, name: &str, params: ToolParams) -> ToolResult {
        self.dispatch_request(ToolRequest {
            index: 0,
            name: name.to_string(),
            params,
        })
        .await
    }

    /// 执行一个请求；超时返回 Timeout，panic 转为 Execution，均输出审计日志
    pub async fn dispatch_request(&self, request: ToolRequest) -> ToolResult {
        let start = Instant::now();
        let payload = match self.registry.get(&request.name) {
            None => Err(ToolError::NotFound(request.name.clone())),
            Some(tool) => {
                let guarded = AssertUnwindSafe(tool.execute(&request.params)).catch_unwind();
                match timeout(self.timeout, guarded).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(ToolError::execution(&request.name, "tool panicked")),
                    Err(_) => Err(ToolError::Timeout(request.name.clone())),
                }
            }
        };
        let duration = start.elapsed();

        let outcome = match &payload {
            Ok(_) => "ok",
            Err(ToolError::Timeout(_)) => "timeout",
            Err(ToolError::NotFound(_)) => "not_found",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.name,
            "index": request.index,
            "ok": payload.is_ok(),
            "outcome": outcome,
            "duration_ms": duration.as_millis() as u64,
            "params_preview": params_preview(&request.params),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        ToolResult {
            index: request.index,
            name: request.name,
            params: request.params,
            payload,
            duration,
        }
    }

    /// 并发调用一批工具；返回顺序与请求顺序一致
    pub async fn dispatch_parallel<I>(&self, calls: I) -> Vec<ToolResult>
    where
        I: IntoIterator<Item = (String, ToolParams)>,
    {
        let requests: Vec<ToolRequest> = calls
            .into_iter()
            .enumerate()
            .map(|(index, (name, params))| ToolRequest {
                index,
                name,
                params,
            })
            .collect();
        tracing::debug!(count = requests.len(), "dispatching tool batch");

        let mut results = join_all(requests.into_iter().map(|r| self.dispatch_request(r))).await;
        results.sort_by_key(|r| r.index);
        results
    }
}

fn params_preview(params: &ToolParams) -> String {
    let s = serde_json::Value::Object(params.clone()).to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
