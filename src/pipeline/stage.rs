//! 阶段抽象：消费累积上下文，发起 0..N 次弹性调用，返回 StageOutcome（结果 + 用量 + 继续/停止）

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::StageFailure;
use crate::llm::UsageRecord;
use crate::pipeline::StageRunner;
use crate::tools::{ToolDispatcher, ToolParams};

/// 阶段结果
#[derive(Debug, Clone)]
pub struct StageOutcome<T> {
    pub output: T,
    pub usage: UsageRecord,
    /// false 表示流水线在此停止（门控拒绝）
    pub proceed: bool,
    /// 以兜底值收场时的原因
    pub failure: Option<StageFailure>,
}

impl<T> StageOutcome<T> {
    pub fn proceed(output: T, usage: UsageRecord) -> Self {
        Self {
            output,
            usage,
            proceed: true,
            failure: None,
        }
    }

    pub fn stop(output: T, usage: UsageRecord) -> Self {
        Self {
            output,
            usage,
            proceed: false,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: Option<StageFailure>) -> Self {
        self.failure = failure;
        self
    }
}

/// 累积上下文：原始输入 + 已完成阶段的输出
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    input: String,
    outputs: Vec<(String, Value)>,
}

impl StageContext {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            outputs: Vec::new(),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn get(&self, stage: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, value)| value)
    }

    pub fn push(&mut self, stage: impl Into<String>, output: Value) {
        self.outputs.push((stage.into(), output));
    }

    /// 替换模板中的 `{input}` 与 `{<阶段名>}`；字符串原样代入，其它值代入 JSON
    ///
    /// 单遍扫描模板：代入的文本不会再被当作占位符，未知占位符原样保留。
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let key = after
                .find(|c: char| c == '}' || c == '{')
                .filter(|&end| after[end..].starts_with('}'))
                .map(|end| &after[..end]);
            match key.and_then(|key| self.placeholder(key).map(|text| (key, text))) {
                Some((key, text)) => {
                    rendered.push_str(&text);
                    rest = &after[key.len() + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);
        rendered
    }

    fn placeholder(&self, key: &str) -> Option<String> {
        if key == "input" {
            return Some(self.input.clone());
        }
        self.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// 流水线阶段
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> StageOutcome<Value>;
}

/// 变换阶段：一次自由文本模型调用；调用失败时输出空串并记为失败，流水线继续
pub struct PromptStage {
    name: String,
    template: String,
    runner: StageRunner,
}

impl PromptStage {
    pub fn new(name: impl Into<String>, template: impl Into<String>, runner: StageRunner) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            runner,
        }
    }
}

#[async_trait]
impl Stage for PromptStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> StageOutcome<Value> {
        let prompt = ctx.render(&self.template);
        let outcome = self.runner.text_turn(&self.name, &prompt).await;
        StageOutcome {
            output: Value::String(outcome.output),
            usage: outcome.usage,
            proceed: true,
            failure: outcome.failure,
        }
    }
}

/// 能力阶段：以当前输入调用一个已注册工具；工具失败时输出空串并记为失败，流水线继续
pub struct CapabilityStage {
    name: String,
    tool: String,
    param: String,
    dispatcher: Arc<ToolDispatcher>,
}

impl CapabilityStage {
    /// `param`：输入文本放入的参数名
    pub fn new(
        name: impl Into<String>,
        tool: impl Into<String>,
        param: impl Into<String>,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            param: param.into(),
            dispatcher,
        }
    }
}

#[async_trait]
impl Stage for CapabilityStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> StageOutcome<Value> {
        let mut params = ToolParams::new();
        params.insert(self.param.clone(), json!(ctx.input()));
        let result = self.dispatcher.dispatch(&self.tool, params).await;
        match result.payload {
            Ok(text) => StageOutcome::proceed(Value::String(text), UsageRecord::default()),
            Err(e) => {
                tracing::warn!(stage = %self.name, tool = %self.tool, error = %e, "capability stage failed");
                StageOutcome::proceed(Value::String(String::new()), UsageRecord::default())
                    .with_failure(Some(StageFailure::Tool(e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_input_and_outputs() {
        let mut ctx = StageContext::new("post body");
        ctx.push("keywords", json!(["rust", "tokio"]));
        ctx.push("summary", json!("short"));

        let rendered = ctx.render("in={input} kw={keywords} s={summary} missing={other}");
        assert_eq!(
            rendered,
            "in=post body kw=[\"rust\",\"tokio\"] s=short missing={other}"
        );
        assert_eq!(ctx.get("summary"), Some(&json!("short")));
        assert!(ctx.get("nope").is_none());
    }

    #[test]
    fn test_render_does_not_expand_substituted_text() {
        let mut ctx = StageContext::new("literal {keywords} in the post");
        ctx.push("keywords", json!("kw"));

        assert_eq!(
            ctx.render("{input} / {keywords} / {{keywords}}"),
            "literal {keywords} in the post / kw / {kw}"
        );
    }

    #[tokio::test]
    async fn test_capability_failure_yields_empty_output() {
        let dispatcher = Arc::new(ToolDispatcher::new(crate::tools::ToolRegistry::new(), 5));
        let stage = CapabilityStage::new("extract", "missing_tool", "text", dispatcher);

        let outcome = stage.run(&StageContext::new("post")).await;

        assert!(outcome.proceed);
        assert_eq!(outcome.output, json!(""));
        assert!(matches!(
            outcome.failure,
            Some(StageFailure::Tool(crate::core::ToolError::NotFound(_)))
        ));
    }
}
