//! 线性流水线与批处理
//!
//! 阶段顺序固定；唯一的分支是门控拒绝（proceed = false）时提前结束。批处理中每个条目独立跑完整条
//! 流水线，条目间并发，但共享同一个并发闸门；结果顺序与输入顺序一致。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::llm::{UsageRecord, UsageTotals};
use crate::pipeline::{Stage, StageContext};

/// 单个阶段的执行记录
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub output: Value,
    pub usage: UsageRecord,
    /// 以兜底值收场
    pub degraded: bool,
    /// 降级原因
    pub error: Option<String>,
}

/// 单个条目的流水线结果
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub input: String,
    pub accepted: bool,
    /// 停止所在阶段（门控拒绝）
    pub stopped_at: Option<String>,
    pub rejection_reason: Option<String>,
    pub stages: Vec<StageRecord>,
    pub usage: UsageTotals,
}

impl PipelineReport {
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.stages
            .iter()
            .find(|record| record.stage == stage)
            .map(|record| &record.output)
    }

    pub fn needed_retries(&self) -> bool {
        self.usage.retries > 0
    }
}

/// 批次汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub items: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_retries: u32,
    /// 至少发生过一次重试的条目数
    pub items_with_retries: usize,
    pub degraded_stages: u32,
}

impl BatchSummary {
    pub fn from_reports(reports: &[PipelineReport]) -> Self {
        reports.iter().fold(Self::default(), |mut summary, report| {
            summary.items += 1;
            if report.accepted {
                summary.accepted += 1;
            } else {
                summary.rejected += 1;
            }
            summary.total_tokens += report.usage.total_tokens;
            summary.total_cost += report.usage.cost;
            summary.total_retries += report.usage.retries;
            summary.degraded_stages += report.usage.failures;
            if report.needed_retries() {
                summary.items_with_retries += 1;
            }
            summary
        })
    }
}

/// 线性流水线
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// 处理一个条目
    pub async fn run(&self, input: &str) -> PipelineReport {
        let mut ctx = StageContext::new(input);
        let mut report = PipelineReport {
            input: input.to_string(),
            accepted: true,
            stopped_at: None,
            rejection_reason: None,
            stages: Vec::with_capacity(self.stages.len()),
            usage: UsageTotals::default(),
        };

        for stage in &self.stages {
            let outcome = stage.run(&ctx).await;
            report.usage.record(&outcome.usage);
            if outcome.failure.is_some() {
                report.usage.record_failure();
            }
            report.stages.push(StageRecord {
                stage: stage.name().to_string(),
                output: outcome.output.clone(),
                usage: outcome.usage,
                degraded: outcome.failure.is_some(),
                error: outcome.failure.as_ref().map(|e| e.to_string()),
            });

            if !outcome.proceed {
                report.accepted = false;
                report.stopped_at = Some(stage.name().to_string());
                report.rejection_reason = outcome
                    .output
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tracing::info!(stage = stage.name(), "pipeline stopped early");
                break;
            }
            ctx.push(stage.name(), outcome.output);
        }

        report
    }

    /// 并发处理一批条目，结果与输入顺序一致
    pub async fn run_batch<I, S>(&self, inputs: I) -> (Vec<PipelineReport>, BatchSummary)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inputs: Vec<S> = inputs.into_iter().collect();
        tracing::info!(items = inputs.len(), stages = ?self.stage_names(), "batch started");
        let reports = join_all(inputs.iter().map(|input| self.run(input.as_ref()))).await;
        let summary = BatchSummary::from_reports(&reports);
        tracing::info!(
            items = summary.items,
            accepted = summary.accepted,
            rejected = summary.rejected,
            total_tokens = summary.total_tokens,
            total_cost = summary.total_cost,
            total_retries = summary.total_retries,
            "batch finished"
        );
        (reports, summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{ProviderError, ResilientCaller, RetryConfig};
    use crate::llm::{MockLlmClient, MockReply, PricingTable};
    use crate::pipeline::{CapabilityStage, GateStage, PromptStage, StageRunner};
    use crate::tools::{ToolDispatcher, ToolRegistry};

    fn runner(mock: Arc<MockLlmClient>, caller: &ResilientCaller) -> StageRunner {
        StageRunner::new(mock, caller.clone(), Arc::new(PricingTable::new()))
    }

    fn pipeline(gate: Arc<MockLlmClient>, extract: Arc<MockLlmClient>, generate: Arc<MockLlmClient>) -> Pipeline {
        let caller = ResilientCaller::new(3, RetryConfig::default().with_max_attempts(1));
        Pipeline::new()
            .stage(GateStage::new("screen", "Screen: {input}", runner(gate, &caller)))
            .stage(PromptStage::new("keywords", "Keywords of: {input}", runner(extract, &caller)))
            .stage(PromptStage::new(
                "questions",
                "Questions for {input} using {keywords}",
                runner(generate, &caller),
            ))
    }

    #[tokio::test]
    async fn test_gate_reject_skips_generate() {
        let gate = Arc::new(MockLlmClient::with_texts([
            r#"{"decision": "REJECT", "reason": "not a question"}"#,
        ]));
        let extract = Arc::new(MockLlmClient::new());
        let generate = Arc::new(MockLlmClient::new());

        let report = pipeline(gate, extract.clone(), generate.clone()).run("hello").await;

        assert!(!report.accepted);
        assert_eq!(report.stopped_at.as_deref(), Some("screen"));
        assert_eq!(report.rejection_reason.as_deref(), Some("not a question"));
        assert_eq!(extract.calls(), 0);
        assert_eq!(generate.calls(), 0);
    }

    #[tokio::test]
    async fn test_accept_runs_all_stages_with_context() {
        let gate = Arc::new(MockLlmClient::with_texts([
            r#"```json
{"decision": "ACCEPT", "reason": "relevant"}
```"#,
        ]));
        let extract = Arc::new(MockLlmClient::with_texts(["rust, async"]));
        let generate = Arc::new(MockLlmClient::with_texts(["Q1? Q2?"]));

        let report = pipeline(gate, extract, generate.clone()).run("post").await;

        assert!(report.accepted);
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.output("questions"), Some(&Value::String("Q1? Q2?".to_string())));
        assert_eq!(generate.prompts()[0], "Questions for post using rust, async");
        assert_eq!(report.usage.total_tokens, 45);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_input_order() {
        let gate = Arc::new(MockLlmClient::scripted(vec![
            MockReply::Delayed(
                Duration::from_millis(200),
                r#"{"decision": "ACCEPT", "reason": "a"}"#.to_string(),
            ),
            MockReply::Delayed(
                Duration::from_millis(10),
                r#"{"decision": "REJECT", "reason": "b"}"#.to_string(),
            ),
        ]));
        let extract = Arc::new(MockLlmClient::new().with_default_reply("kw"));
        let generate = Arc::new(MockLlmClient::new().with_default_reply("q"));

        let (reports, summary) = pipeline(gate, extract, generate)
            .run_batch(["first", "second"])
            .await;

        assert_eq!(reports[0].input, "first");
        assert!(reports[0].accepted);
        assert_eq!(reports[1].input, "second");
        assert!(!reports[1].accepted);
        assert_eq!(summary.items, 2);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.items_with_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_counts_retries_of_exhausted_calls() {
        let throttled = || MockReply::Fail(ProviderError::throttled("Rate limit reached. Please try again in 5ms."));
        let mock = Arc::new(MockLlmClient::scripted(vec![throttled(), throttled(), throttled()]));
        let caller = ResilientCaller::new(2, RetryConfig::default().with_max_attempts(3));
        let pipeline = Pipeline::new().stage(PromptStage::new("keywords", "Keywords of: {input}", runner(mock.clone(), &caller)));

        let (reports, summary) = pipeline.run_batch(["post"]).await;

        assert_eq!(mock.calls(), 3);
        assert_eq!(reports[0].output("keywords"), Some(&Value::String(String::new())));
        assert!(reports[0].stages[0].degraded);
        assert_eq!(summary.total_retries, 2);
        assert_eq!(summary.items_with_retries, 1);
        assert_eq!(summary.degraded_stages, 1);
    }

    #[tokio::test]
    async fn test_failed_capability_counts_as_degraded() {
        let generate = Arc::new(MockLlmClient::new().with_default_reply("q"));
        let caller = ResilientCaller::new(2, RetryConfig::default().with_max_attempts(1));
        let dispatcher = Arc::new(ToolDispatcher::new(ToolRegistry::new(), 5));
        let pipeline = Pipeline::new()
            .stage(CapabilityStage::new("extract", "ghost", "text", dispatcher))
            .stage(PromptStage::new("questions", "Questions about [{extract}]", runner(generate.clone(), &caller)));

        let (reports, summary) = pipeline.run_batch(["post"]).await;

        assert!(reports[0].accepted);
        assert_eq!(reports[0].stages[0].error.as_deref(), Some("Tool ghost not found"));
        assert_eq!(generate.prompts(), vec!["Questions about []"]);
        assert_eq!(summary.degraded_stages, 1);
    }
}
