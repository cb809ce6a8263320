//! 运行状态：单一所有者（Orchestrator）的可变累加器
//!
//! 任务文本创建后不可变；研究数据按操作标签存储（键唯一）；推理步骤按序追加；
//! 最终产物只能在完成标记置位的同一步写入，之后状态被封存，任何写入都返回 StateError::Sealed。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::StateError;

/// 产物（推荐条目等）：结构由模型输出决定，引擎不解释其语义
pub type Artifact = serde_json::Value;

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Research,
    Draft,
    Critique,
    Finalize,
    Done,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Research => "research",
            AgentPhase::Draft => "draft",
            AgentPhase::Critique => "critique",
            AgentPhase::Finalize => "finalize",
            AgentPhase::Done => "done",
        }
    }
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次运行的状态
#[derive(Clone, Debug, Serialize)]
pub struct OrchestrationState {
    task: String,
    phase: AgentPhase,
    research: BTreeMap<String, String>,
    reasoning_steps: Vec<String>,
    draft_artifacts: Vec<Artifact>,
    final_artifacts: Vec<Artifact>,
    completed: bool,
}

impl OrchestrationState {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            phase: AgentPhase::Research,
            research: BTreeMap::new(),
            reasoning_steps: Vec::new(),
            draft_artifacts: Vec::new(),
            final_artifacts: Vec::new(),
            completed: false,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn research(&self) -> &BTreeMap<String, String> {
        &self.research
    }

    pub fn reasoning_steps(&self) -> &[String] {
        &self.reasoning_steps
    }

    pub fn draft_artifacts(&self) -> &[Artifact] {
        &self.draft_artifacts
    }

    pub fn final_artifacts(&self) -> &[Artifact] {
        &self.final_artifacts
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// 已记录的研究标签（用于 prompt 中的 "Previous searches"）
    pub fn research_labels(&self) -> Vec<&str> {
        self.research.keys().map(String::as_str).collect()
    }

    pub fn enter_phase(&mut self, phase: AgentPhase) -> Result<(), StateError> {
        self.ensure_open()?;
        self.phase = phase;
        Ok(())
    }

    /// 记录一次操作输出；同一标签再次写入会覆盖旧值（记一条 warn）
    pub fn record_research(
        &mut self,
        label: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<(), StateError> {
        self.ensure_open()?;
        let label = label.into();
        if self.research.contains_key(&label) {
            tracing::warn!(label = %label, "research label already recorded, replacing");
        }
        self.research.insert(label, output.into());
        Ok(())
    }

    /// 未被占用的标签：已占用时依次尝试 `label#2`、`label#3` ...
    pub fn unique_label(&self, label: String) -> String {
        if !self.research.contains_key(&label) {
            return label;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{label}#{n}");
            if !self.research.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn add_reasoning_step(&mut self, step: impl Into<String>) -> Result<(), StateError> {
        self.ensure_open()?;
        self.reasoning_steps.push(step.into());
        Ok(())
    }

    pub fn set_draft_artifacts(&mut self, artifacts: Vec<Artifact>) -> Result<(), StateError> {
        self.ensure_open()?;
        self.draft_artifacts = artifacts;
        Ok(())
    }

    /// 置位完成标记并写入最终产物；此后状态封存
    pub fn complete(&mut self, final_artifacts: Vec<Artifact>) -> Result<(), StateError> {
        self.ensure_open()?;
        self.completed = true;
        self.phase = AgentPhase::Done;
        self.final_artifacts = final_artifacts;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.completed {
            Err(StateError::Sealed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_state_is_open() {
        let state = OrchestrationState::new("best cafes in the adelaide hills");
        assert_eq!(state.task(), "best cafes in the adelaide hills");
        assert_eq!(state.phase(), AgentPhase::Research);
        assert!(!state.is_completed());
        assert!(state.final_artifacts().is_empty());
    }

    #[test]
    fn test_research_labels_are_unique() {
        let mut state = OrchestrationState::new("q");
        state.record_research("search_0", "first").unwrap();
        state.record_research("search_0", "second").unwrap();
        state.record_research("search_1", "third").unwrap();
        assert_eq!(state.research().len(), 2);
        assert_eq!(state.research()["search_0"], "second");
        assert_eq!(state.research_labels(), vec!["search_0", "search_1"]);
    }

    #[test]
    fn test_unique_label_skips_taken_keys() {
        let mut state = OrchestrationState::new("q");
        assert_eq!(state.unique_label("a_1_0".to_string()), "a_1_0");
        state.record_research("a_1_0", "x").unwrap();
        assert_eq!(state.unique_label("a_1_0".to_string()), "a_1_0#2");
        state.record_research("a_1_0#2", "y").unwrap();
        assert_eq!(state.unique_label("a_1_0".to_string()), "a_1_0#3");
    }

    #[test]
    fn test_complete_seals_state() {
        let mut state = OrchestrationState::new("q");
        state.add_reasoning_step("look around").unwrap();
        state.complete(vec![json!({"name": "Cafe"})]).unwrap();

        assert!(state.is_completed());
        assert_eq!(state.phase(), AgentPhase::Done);
        assert_eq!(state.final_artifacts().len(), 1);

        assert_eq!(state.add_reasoning_step("late"), Err(StateError::Sealed));
        assert_eq!(state.record_research("x", "y"), Err(StateError::Sealed));
        assert_eq!(state.complete(vec![]), Err(StateError::Sealed));
        assert_eq!(state.reasoning_steps().len(), 1);
        assert_eq!(state.final_artifacts().len(), 1);
    }
}
