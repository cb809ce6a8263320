//! Agent 编排器：RESEARCH → DRAFT → CRITIQUE → FINALIZE
//!
//! RESEARCH / CRITIQUE 是有迭代上限的推理循环：推理回合 → 解析决策 → 调度工具（单个 / 并行）→
//! 合并进状态；显式 finalize 或达到上限即结束。DRAFT 与 FINALIZE 各一次弹性调用，无工具调度。
//! 任何阶段失败都降级为兜底值，运行总能返回结构完整的 RunResult。
//! 状态只有编排器一个写者；工具结果在批次全部返回后才合并。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{AgentPhase, Artifact, OrchestrationState, StageFailure, StateError};
use crate::llm::{UsageRecord, UsageTotals};
use crate::pipeline::StageRunner;
use crate::react::{AgentEvent, ArtifactList, Decision, Parsed, PromptSet, ReasoningContext};
use crate::tools::{ToolDispatcher, ToolResult};

/// 推理循环上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    pub research_iterations: usize,
    pub critique_iterations: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            research_iterations: 20,
            critique_iterations: 20,
        }
    }
}

/// 单个阶段的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseReport {
    pub iterations: usize,
    pub dispatches: usize,
    /// 由决策显式结束（否则是达到上限或被取消）
    pub finalized: bool,
    pub cancelled: bool,
    pub usage: UsageTotals,
}

/// 一次运行的结果
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub task: String,
    pub final_artifacts: Vec<Artifact>,
    /// RESEARCH + CRITIQUE 的推理回合数
    pub iteration_count: usize,
    pub reasoning_steps: usize,
    pub usage_totals: UsageTotals,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 编排器
pub struct Orchestrator {
    runner: StageRunner,
    dispatcher: Arc<ToolDispatcher>,
    prompts: Arc<dyn PromptSet>,
    settings: AgentSettings,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        runner: StageRunner,
        dispatcher: Arc<ToolDispatcher>,
        prompts: Arc<dyn PromptSet>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            runner,
            dispatcher,
            prompts,
            settings,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub async fn run(&self, task: &str) -> RunResult {
        self.execute(task).await.1
    }

    /// 完整运行，同时返回最终状态（已封存）
    pub async fn execute(&self, task: &str) -> (OrchestrationState, RunResult) {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = OrchestrationState::new(task);
        let mut totals = UsageTotals::default();
        tracing::info!(%run_id, task, "run started");

        let research = self.run_research(&mut state).await;
        totals.merge(&research.usage);

        let mut critique = PhaseReport::default();
        if !self.cancel.is_cancelled() {
            totals.merge(&self.run_draft(&mut state).await);
            critique = self.run_critique(&mut state).await;
            totals.merge(&critique.usage);
        }
        totals.merge(&self.run_finalize(&mut state).await);

        let cancelled = self.cancel.is_cancelled();
        let result = RunResult {
            run_id,
            task: task.to_string(),
            final_artifacts: state.final_artifacts().to_vec(),
            iteration_count: research.iterations + critique.iterations,
            reasoning_steps: state.reasoning_steps().len(),
            usage_totals: totals,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        };
        self.emit(AgentEvent::Completed {
            artifacts: result.final_artifacts.len(),
            iterations: result.iteration_count,
        });
        tracing::info!(
            %run_id,
            iterations = result.iteration_count,
            artifacts = result.final_artifacts.len(),
            total_tokens = totals.total_tokens,
            cost = totals.cost,
            retries = totals.retries,
            failures = totals.failures,
            cancelled,
            "run finished"
        );
        (state, result)
    }

    /// RESEARCH 推理循环
    pub async fn run_research(&self, state: &mut OrchestrationState) -> PhaseReport {
        self.reasoning_loop(
            state,
            AgentPhase::Research,
            self.settings.research_iterations,
            format!("User query: {}", state.task()),
        )
        .await
    }

    /// DRAFT：由全部研究数据生成中间产物
    pub async fn run_draft(&self, state: &mut OrchestrationState) -> UsageTotals {
        self.enter(state, AgentPhase::Draft);
        let prompt = self.prompts.draft(state);
        let parsed = self
            .runner
            .structured(
                "draft",
                &prompt,
                ArtifactList::placeholder("Could not parse draft recommendations", "JSON parsing failed"),
            )
            .await;
        let usage = self.account("draft", &parsed);
        tracing::info!(count = parsed.value.len(), "draft artifacts ready");
        self.merge(state.set_draft_artifacts(parsed.value.into_inner()));
        usage
    }

    /// CRITIQUE 推理循环：上下文从草稿开始，研究标签加 critique_ 前缀
    pub async fn run_critique(&self, state: &mut OrchestrationState) -> PhaseReport {
        let draft = serde_json::to_string(state.draft_artifacts()).unwrap_or_else(|_| "[]".to_string());
        self.reasoning_loop(
            state,
            AgentPhase::Critique,
            self.settings.critique_iterations,
            format!("Draft recommendations: {draft}"),
        )
        .await
    }

    /// FINALIZE：折叠研究 + 草稿 + 批判为最终产物并置位完成标记；已取消时不再调用模型
    pub async fn run_finalize(&self, state: &mut OrchestrationState) -> UsageTotals {
        self.enter(state, AgentPhase::Finalize);

        if self.cancel.is_cancelled() {
            tracing::warn!("run cancelled, finalizing without model call");
            let artifacts = if state.draft_artifacts().is_empty() {
                ArtifactList::placeholder("Run cancelled before completion", "Cancelled").into_inner()
            } else {
                state.draft_artifacts().to_vec()
            };
            self.merge(state.complete(artifacts));
            return UsageTotals::default();
        }

        let prompt = self.prompts.finalize(state);
        let parsed = self
            .runner
            .structured(
                "finalize",
                &prompt,
                ArtifactList::placeholder("Could not parse final recommendations", "JSON parsing failed"),
            )
            .await;
        let usage = self.account("finalize", &parsed);
        self.merge(state.complete(parsed.value.into_inner()));
        usage
    }

    async fn reasoning_loop(
        &self,
        state: &mut OrchestrationState,
        phase: AgentPhase,
        max_iterations: usize,
        mut context: String,
    ) -> PhaseReport {
        self.enter(state, phase);
        let (prefix, tag) = match phase {
            AgentPhase::Critique => ("critique_", "Critique Tool"),
            _ => ("", "Tool"),
        };
        let tools_description = self.dispatcher.registry().describe();
        let tools_schema = self.dispatcher.registry().to_schema_json();
        let mut report = PhaseReport::default();

        for iteration in 0..max_iterations {
            if self.cancel.is_cancelled() {
                tracing::warn!(%phase, iteration, "cancelled between iterations");
                report.cancelled = true;
                break;
            }
            self.emit(AgentEvent::Iteration {
                phase,
                iteration: iteration + 1,
                max_iterations,
            });

            let prompt = {
                let ctx = ReasoningContext {
                    task: state.task(),
                    tools_description: &tools_description,
                    tools_schema: &tools_schema,
                    research_labels: state.research_labels(),
                    steps_taken: state.reasoning_steps().len(),
                    context: &context,
                };
                match phase {
                    AgentPhase::Critique => self.prompts.critique(&ctx),
                    _ => self.prompts.research(&ctx),
                }
            };

            let label = format!("{phase}_{iteration}");
            let parsed = self
                .runner
                .structured(&label, &prompt, Decision::parse_failure())
                .await;
            report.usage.merge(&self.account(&label, &parsed));
            report.iterations += 1;

            let decision = parsed.value;
            self.emit(AgentEvent::Decision {
                phase,
                action: decision.action().to_string(),
                reasoning: decision.reasoning().to_string(),
            });
            self.merge(state.add_reasoning_step(decision.reasoning()));

            match decision {
                Decision::UseSingleTool {
                    tool_name,
                    tool_params,
                    ..
                } => {
                    self.emit(AgentEvent::ToolCall {
                        index: 0,
                        tool: tool_name.clone(),
                        params: serde_json::Value::Object(tool_params.clone()),
                    });
                    let result = self.dispatcher.dispatch(&tool_name, tool_params).await;
                    report.dispatches += 1;
                    let key = format!("{prefix}{tool_name}_{iteration}");
                    self.absorb(state, &mut context, tag, key, &result);
                }
                Decision::UseManyTools { tools, .. } => {
                    for (index, call) in tools.iter().enumerate() {
                        self.emit(AgentEvent::ToolCall {
                            index,
                            tool: call.tool_name.clone(),
                            params: serde_json::Value::Object(call.tool_params.clone()),
                        });
                    }
                    let results = self
                        .dispatcher
                        .dispatch_parallel(tools.into_iter().map(|c| (c.tool_name, c.tool_params)))
                        .await;
                    report.dispatches += results.len();
                    for result in &results {
                        let key = format!("{prefix}{}_{iteration}_{}", result.name, result.index);
                        self.absorb(state, &mut context, tag, key, result);
                    }
                }
                Decision::Finalize { reasoning } => {
                    tracing::info!(%phase, iteration, reasoning = %reasoning, "phase finalized");
                    report.finalized = true;
                    break;
                }
            }
        }

        if !report.finalized && !report.cancelled {
            tracing::info!(%phase, max_iterations, "iteration cap reached, finalizing");
        }
        report
    }

    /// 合并一个工具结果：写研究数据、追加上下文；标签冲突时追加 `#n`，不覆盖已有数据
    fn absorb(
        &self,
        state: &mut OrchestrationState,
        context: &mut String,
        tag: &str,
        key: String,
        result: &ToolResult,
    ) {
        let observation = result.observation();
        self.emit(AgentEvent::ToolResult {
            index: result.index,
            tool: result.name.clone(),
            ok: result.is_ok(),
            preview: preview(&observation),
        });
        context.push_str(&format!("\n\n{tag} {}: {}", result.name, observation));
        let label = state.unique_label(key.clone());
        if label != key {
            tracing::warn!(%key, %label, "research label collision, storing under a new label");
        }
        self.merge(state.record_research(label, observation));
    }

    fn enter(&self, state: &mut OrchestrationState, phase: AgentPhase) {
        tracing::info!(%phase, "phase started");
        self.emit(AgentEvent::PhaseStarted { phase });
        self.merge(state.enter_phase(phase));
    }

    /// 记账：用量 + 降级计数 + 事件
    fn account<C>(&self, stage: &str, parsed: &Parsed<C>) -> UsageTotals {
        let mut totals = UsageTotals::default();
        totals.record(&parsed.usage);
        self.emit_usage(stage, &parsed.usage);
        if let Some(failure) = &parsed.failure {
            totals.record_failure();
            self.emit_fallback(stage, failure);
        }
        totals
    }

    fn emit_usage(&self, stage: &str, usage: &UsageRecord) {
        self.emit(AgentEvent::Usage {
            stage: stage.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: usage.cost,
            retries: usage.retries,
        });
    }

    fn emit_fallback(&self, stage: &str, failure: &StageFailure) {
        self.emit(AgentEvent::Fallback {
            stage: stage.to_string(),
            reason: failure.to_string(),
        });
    }

    fn merge(&self, result: Result<(), StateError>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "state update rejected");
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 120 {
        format!("{}...", text.chars().take(120).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::{ResilientCaller, RetryConfig, ToolError};
    use crate::llm::{MockLlmClient, PricingTable};
    use crate::react::DefaultPrompts;
    use crate::tools::{EchoTool, Tool, ToolParams, ToolRegistry};

    struct CountingTool {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Counts invocations"
        }

        async fn execute(&self, _params: &ToolParams) -> Result<String, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} result", self.name))
        }
    }

    fn orchestrator(mock: Arc<MockLlmClient>, registry: ToolRegistry, settings: AgentSettings) -> Orchestrator {
        let runner = StageRunner::new(
            mock,
            ResilientCaller::new(2, RetryConfig::default().with_max_attempts(1)),
            Arc::new(PricingTable::new()),
        );
        Orchestrator::new(
            runner,
            Arc::new(ToolDispatcher::new(registry, 5)),
            Arc::new(DefaultPrompts),
            settings,
        )
    }

    #[tokio::test]
    async fn test_research_parallel_then_finalize() {
        let mock = Arc::new(MockLlmClient::with_texts([
            r#"{"action": "use_tools", "tools": [
                {"tool_name": "search", "tool_params": {"query": "a"}},
                {"tool_name": "comments", "tool_params": {"post_id": "1"}}
            ], "reasoning": "gather"}"#,
            r#"{"action": "finalize", "reasoning": "enough"}"#,
        ]));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool {
            name: "search",
            calls: calls.clone(),
        });
        registry.register(CountingTool {
            name: "comments",
            calls: calls.clone(),
        });

        let agent = orchestrator(mock, registry, AgentSettings::default());
        let mut state = OrchestrationState::new("best hiking boots");
        let report = agent.run_research(&mut state).await;

        assert_eq!(report.iterations, 2);
        assert_eq!(report.dispatches, 2);
        assert!(report.finalized);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(state.research().len(), 2);
        assert_eq!(state.research()["search_0_0"], "search result");
        assert_eq!(state.research()["comments_0_1"], "comments result");
        assert_eq!(state.reasoning_steps(), &["gather".to_string(), "enough".to_string()]);
    }

    #[tokio::test]
    async fn test_iteration_cap_bounds_dispatches() {
        let mock = Arc::new(MockLlmClient::new().with_default_reply(
            r#"{"action": "use_tool", "tool_name": "search", "tool_params": {"query": "again"}, "reasoning": "more"}"#,
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool {
            name: "search",
            calls: calls.clone(),
        });

        let agent = orchestrator(
            mock,
            registry,
            AgentSettings {
                research_iterations: 3,
                critique_iterations: 0,
            },
        );
        let mut state = OrchestrationState::new("q");
        let report = agent.run_research(&mut state).await;

        assert_eq!(report.iterations, 3);
        assert!(!report.finalized);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.research_labels(), vec!["search_0", "search_1", "search_2"]);
    }

    #[tokio::test]
    async fn test_colliding_labels_keep_both_results() {
        let mock = Arc::new(MockLlmClient::with_texts([
            r#"{"action": "use_tool", "tool_name": "a_1", "tool_params": {}, "reasoning": "first"}"#,
            r#"{"action": "use_tools", "tools": [{"tool_name": "a", "tool_params": {}}], "reasoning": "second"}"#,
            r#"{"action": "finalize", "reasoning": "done"}"#,
        ]));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool {
            name: "a_1",
            calls: calls.clone(),
        });
        registry.register(CountingTool {
            name: "a",
            calls: calls.clone(),
        });

        let agent = orchestrator(mock, registry, AgentSettings::default());
        let mut state = OrchestrationState::new("q");
        agent.run_research(&mut state).await;

        assert_eq!(state.research().len(), 2);
        assert_eq!(state.research()["a_1_0"], "a_1 result");
        assert_eq!(state.research()["a_1_0#2"], "a result");
    }

    #[tokio::test]
    async fn test_loop_context_names_query_and_critique_tools() {
        let mock = Arc::new(MockLlmClient::with_texts([
            r#"{"action": "use_tool", "tool_name": "echo", "tool_params": {"text": "loud"}, "reasoning": "look"}"#,
            r#"{"action": "finalize", "reasoning": "done"}"#,
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let agent = orchestrator(mock.clone(), registry, AgentSettings::default());

        let mut state = OrchestrationState::new("quiet fans");
        agent.run_critique(&mut state).await;
        let mut state = OrchestrationState::new("quiet fans");
        agent.run_research(&mut state).await;

        let prompts = mock.prompts();
        assert!(prompts[1].contains("Critique Tool echo: loud"));
        assert!(prompts[2].contains("User query: quiet fans"));
    }

    #[tokio::test]
    async fn test_full_run_completes_and_seals_state() {
        let mock = Arc::new(MockLlmClient::with_texts([
            r#"{"action": "use_tool", "tool_name": "echo", "tool_params": {"text": "trail runners"}, "reasoning": "look"}"#,
            r#"{"action": "finalize", "reasoning": "done"}"#,
            r#"[{"name": "Boot A", "description": "d", "reasoning": "r"}]"#,
            r#"{"action": "use_tool", "tool_name": "echo", "tool_params": {"text": "blisters"}, "reasoning": "critique"}"#,
            r#"{"action": "finalize", "reasoning": "balanced"}"#,
            r#"```json
[{"name": "Boot A", "pros": "grip", "cons": "blisters"}, {"name": "Boot B"}]
```"#,
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agent = orchestrator(mock.clone(), registry, AgentSettings::default()).with_events(tx);

        let (state, result) = agent.execute("hiking boots").await;

        assert!(state.is_completed());
        assert_eq!(state.phase(), AgentPhase::Done);
        assert_eq!(result.final_artifacts.len(), 2);
        assert_eq!(result.final_artifacts[0]["cons"], json!("blisters"));
        assert_eq!(result.iteration_count, 4);
        assert_eq!(result.reasoning_steps, 4);
        assert_eq!(result.usage_totals.failures, 0);
        assert_eq!(result.usage_totals.total_tokens, 6 * 15);
        assert_eq!(mock.calls(), 6);
        assert_eq!(state.research()["echo_0"], "trail runners");
        assert_eq!(state.research()["critique_echo_0"], "blisters");
        assert!(mock.prompts()[3].contains("Boot A"));

        drop(agent);
        let mut completed = false;
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Completed { artifacts, .. } = event {
                assert_eq!(artifacts, 2);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_unparseable_output_degrades_to_placeholders() {
        let mock = Arc::new(MockLlmClient::new().with_default_reply("I cannot answer in JSON"));
        let agent = orchestrator(mock.clone(), ToolRegistry::new(), AgentSettings::default());

        let result = agent.run("anything").await;

        // research / draft / critique / finalize 各重试一次
        assert_eq!(mock.calls(), 8);
        assert_eq!(result.iteration_count, 2);
        assert_eq!(result.usage_totals.failures, 4);
        assert_eq!(result.final_artifacts.len(), 1);
        assert_eq!(result.final_artifacts[0]["name"], "Error");
    }

    #[tokio::test]
    async fn test_cancelled_run_still_returns_result() {
        let mock = Arc::new(MockLlmClient::new());
        let token = CancellationToken::new();
        token.cancel();
        let agent = orchestrator(mock.clone(), ToolRegistry::new(), AgentSettings::default())
            .with_cancel_token(token);

        let (state, result) = agent.execute("q").await;

        assert!(result.cancelled);
        assert!(state.is_completed());
        assert_eq!(mock.calls(), 0);
        assert_eq!(result.final_artifacts[0]["reasoning"], "Cancelled");
    }
}
