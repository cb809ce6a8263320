//! Prompt 模板
//!
//! 引擎只依赖 PromptSet trait；DefaultPrompts 是通用的"调研 → 草稿 → 批判 → 终稿"模板，
//! 决策格式与 react::decision 的契约一致。

use serde_json::Value;

use crate::core::OrchestrationState;
use crate::react::decision_schema_json;

/// 推理回合的输入
#[derive(Debug, Clone)]
pub struct ReasoningContext<'a> {
    pub task: &'a str,
    /// "- name: description" 逐行
    pub tools_description: &'a str,
    /// 各工具参数的 JSON Schema 列表
    pub tools_schema: &'a str,
    pub research_labels: Vec<&'a str>,
    pub steps_taken: usize,
    /// 本阶段累积的上下文（工具观察等）
    pub context: &'a str,
}

/// 四类 prompt
pub trait PromptSet: Send + Sync {
    fn research(&self, ctx: &ReasoningContext<'_>) -> String;

    fn draft(&self, state: &OrchestrationState) -> String;

    fn critique(&self, ctx: &ReasoningContext<'_>) -> String;

    fn finalize(&self, state: &OrchestrationState) -> String;
}

/// 默认模板
#[derive(Debug, Clone, Default)]
pub struct DefaultPrompts;

const DECISION_FORMAT: &str = r#"Respond in JSON format.

For a single tool:
{
    "action": "use_tool",
    "tool_name": "<tool name>",
    "tool_params": {"query": "specific search query"},
    "reasoning": "why you're using this tool"
}

For several tools at once (preferred, they run in parallel):
{
    "action": "use_tools",
    "tools": [
        {"tool_name": "<tool name>", "tool_params": {"query": "search query 1"}},
        {"tool_name": "<tool name>", "tool_params": {"query": "search query 2"}}
    ],
    "reasoning": "why you're using these tools together"
}

When you are done:
{
    "action": "finalize",
    "reasoning": "why you're done"
}"#;

/// 决策格式说明 + schemars 生成的 JSON Schema
fn decision_format() -> String {
    format!("{DECISION_FORMAT}\n\nThe response must validate against this JSON Schema:\n{}", decision_schema_json())
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

impl PromptSet for DefaultPrompts {
    fn research(&self, ctx: &ReasoningContext<'_>) -> String {
        format!(
            "You are a research agent that finds well-supported recommendations by analyzing community discussions.\n\n\
             Available tools:\n{tools}\n\n\
             Tool parameters:\n{schema}\n\n\
             Current state:\n\
             - Query: {task}\n\
             - Previous searches: {labels:?}\n\
             - Steps taken: {steps}\n\n\
             Context: {context}\n\n\
             Instructions:\n\
             - Search for discussions where people recommend or ask about similar things\n\
             - Prefer sources with strong engagement; repeated mentions indicate consensus\n\
             - Collect at least 5 strong sources before finalizing\n\n\
             {format}",
            tools = ctx.tools_description,
            schema = ctx.tools_schema,
            task = ctx.task,
            labels = ctx.research_labels,
            steps = ctx.steps_taken,
            context = ctx.context,
            format = decision_format(),
        )
    }

    fn draft(&self, state: &OrchestrationState) -> String {
        format!(
            "Based on your research so far, create 3 draft recommendations.\n\n\
             Original Query: {task}\n\n\
             Research: {research}\n\n\
             Research Process: {steps}\n\n\
             Return a JSON array of objects with:\n\
             - name: specific recommendation name\n\
             - description: brief description\n\
             - reasoning: why this seems good from the research",
            task = state.task(),
            research = to_json(state.research()),
            steps = to_json(&state.reasoning_steps()),
        )
    }

    fn critique(&self, ctx: &ReasoningContext<'_>) -> String {
        format!(
            "You have generated draft recommendations. Now critically analyze them by searching for \
             negative feedback, complaints, alternative viewpoints and downsides.\n\n\
             Available tools:\n{tools}\n\n\
             Tool parameters:\n{schema}\n\n\
             Original Query: {task}\n\n\
             {context}\n\n\
             {format}",
            tools = ctx.tools_description,
            schema = ctx.tools_schema,
            task = ctx.task,
            context = ctx.context,
            format = decision_format(),
        )
    }

    fn finalize(&self, state: &OrchestrationState) -> String {
        let research = state.research();
        let (critique, initial): (Vec<(&String, &String)>, Vec<(&String, &String)>) = research
            .iter()
            .partition(|(label, _)| label.starts_with("critique_"));
        let initial: serde_json::Map<String, Value> = initial
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let critique: serde_json::Map<String, Value> = critique
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        format!(
            "Based on your research AND critique findings, create 3 balanced recommendations.\n\n\
             Original Query: {task}\n\n\
             Initial Research: {initial}\n\n\
             Draft Recommendations: {draft}\n\n\
             Critique Research: {critique}\n\n\
             Include both positive aspects and discovered issues.\n\n\
             Return a JSON array of objects with:\n\
             - name: specific recommendation name\n\
             - description: what it is and why people recommend it\n\
             - pros: what people love about it\n\
             - cons: issues or criticisms found (if any)\n\
             - reasoning: overall assessment\n\
             - sources: array of source URLs that supported this recommendation",
            task = state.task(),
            initial = to_json(&initial),
            draft = to_json(&state.draft_artifacts()),
            critique = to_json(&critique),
        )
    }
}
