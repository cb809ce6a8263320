//! 结构化输出解析
//!
//! 去掉代码围栏后按 JSON 解析，再交给契约（Contract）做字段校验。两类失败区别对待：
//! - Syntax：文本本身不是 JSON，视为采样噪声，对上游原样重试一次；仍失败则返回调用方注入的兜底值；
//! - Schema：JSON 合法但违反契约，不重试，直接返回契约的 invalid_format 兜底值。
//! 上游调用失败（CallError）同样返回注入的兜底值。解析器从不向外抛错，失败原因随结果返回。

use std::future::Future;

use serde_json::Value;

use crate::core::{CallError, ParseError, StageFailure};
use crate::llm::UsageRecord;

/// 结构化输出契约
pub trait Contract: Sized {
    /// 契约名（日志用）
    const NAME: &'static str;

    /// 校验并构造；缺字段 / 类型不符返回 ParseError::Schema
    fn from_value(value: Value) -> Result<Self, ParseError>;

    /// 契约违规时的兜底值
    fn invalid_format(detail: &str) -> Self;
}

/// 去掉首尾的 ``` / ```json 围栏
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(nl) if rest[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => &rest[nl + 1..],
        _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// 从文本中取出 JSON 主体：先去围栏；若仍夹带说明文字，取最外层 {...} 或 [...]
fn extract_json_body(raw: &str) -> &str {
    let body = strip_code_fences(raw);
    if body.starts_with('{') || body.starts_with('[') {
        return body;
    }
    let span = match (body.find('{'), body.find('[')) {
        (Some(o), Some(a)) if a < o => body.rfind(']').map(|end| (a, end)),
        (Some(o), _) => body.rfind('}').map(|end| (o, end)),
        (None, Some(a)) => body.rfind(']').map(|end| (a, end)),
        (None, None) => None,
    };
    match span {
        Some((start, end)) if start < end => &body[start..=end],
        _ => body,
    }
}

/// 解析一段模型输出为契约类型
pub fn parse_structured<C: Contract>(raw: &str) -> Result<C, ParseError> {
    let body = extract_json_body(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| ParseError::Syntax(e.to_string()))?;
    C::from_value(value)
}

/// 解析结果：值（或兜底值）+ 全部上游调用的用量 + 失败原因（若降级）
#[derive(Debug, Clone)]
pub struct Parsed<C> {
    pub value: C,
    pub usage: UsageRecord,
    pub failure: Option<StageFailure>,
}

impl<C> Parsed<C> {
    pub fn is_fallback(&self) -> bool {
        self.failure.is_some()
    }
}

/// 结构化响应解析器
#[derive(Debug, Clone, Copy)]
pub struct StructuredResponseParser {
    syntax_retries: u32,
}

impl Default for StructuredResponseParser {
    fn default() -> Self {
        Self { syntax_retries: 1 }
    }
}

impl StructuredResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调用上游并解析；`upstream` 每次被调用都发起一次新的（同一 prompt 的）上游请求
    pub async fn resolve<C, F, Fut>(&self, label: &str, mut upstream: F, fallback: C) -> Parsed<C>
    where
        C: Contract,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(String, UsageRecord), CallError>>,
    {
        let mut usage = UsageRecord::default();
        let mut reparsed = 0u32;

        loop {
            let text = match upstream().await {
                Ok((text, record)) => {
                    usage += record;
                    text
                }
                Err(e) => {
                    usage.retries += e.retries();
                    tracing::warn!(label, contract = C::NAME, error = %e, "upstream call failed, using fallback");
                    return Parsed {
                        value: fallback,
                        usage,
                        failure: Some(StageFailure::Call(e)),
                    };
                }
            };

            match parse_structured::<C>(&text) {
                Ok(value) => {
                    return Parsed {
                        value,
                        usage,
                        failure: None,
                    }
                }
                Err(ParseError::Syntax(msg)) if reparsed < self.syntax_retries => {
                    reparsed += 1;
                    usage.retries += 1;
                    tracing::warn!(label, contract = C::NAME, error = %msg, "malformed output, retrying");
                }
                Err(err @ ParseError::Syntax(_)) => {
                    tracing::warn!(
                        label,
                        contract = C::NAME,
                        error = %err,
                        preview = %preview(&text),
                        "malformed output after retry, using fallback"
                    );
                    return Parsed {
                        value: fallback,
                        usage,
                        failure: Some(StageFailure::Parse(err)),
                    };
                }
                Err(ParseError::Schema(msg)) => {
                    tracing::warn!(label, contract = C::NAME, error = %msg, "contract violation");
                    return Parsed {
                        value: C::invalid_format(&msg),
                        usage,
                        failure: Some(StageFailure::Parse(ParseError::Schema(msg))),
                    };
                }
            }
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}
