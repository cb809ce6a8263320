//! 门控阶段：一次弹性调用判定 ACCEPT / REJECT；拒绝时流水线对该条目立即停止，不再进入后续（更贵的）阶段

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::core::{ParseError, StageFailure};
use crate::pipeline::{Stage, StageContext, StageOutcome, StageRunner};
use crate::react::Contract;

/// 门控判定：`{"decision": "ACCEPT" | "REJECT", "reason": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateVerdict {
    pub accept: bool,
    pub reason: String,
}

impl GateVerdict {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            accept: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            reason: reason.into(),
        }
    }

    pub fn decision(&self) -> &'static str {
        if self.accept {
            "ACCEPT"
        } else {
            "REJECT"
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "decision": self.decision(), "reason": self.reason })
    }
}

impl Contract for GateVerdict {
    const NAME: &'static str = "gate";

    fn from_value(value: Value) -> Result<Self, ParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseError::Schema("expected a JSON object".to_string()))?;
        let decision = obj
            .get("decision")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Schema("missing required field `decision`".to_string()))?;
        let reason = obj
            .get("reason")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Schema("missing required field `reason`".to_string()))?;

        match decision.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::accept(reason)),
            "REJECT" => Ok(Self::reject(reason)),
            other => Err(ParseError::Schema(format!(
                "`decision` must be ACCEPT or REJECT, got `{other}`"
            ))),
        }
    }

    fn invalid_format(detail: &str) -> Self {
        Self::reject(format!("Screening failed: invalid response format: {detail}"))
    }
}

/// 门控阶段
pub struct GateStage {
    name: String,
    template: String,
    runner: StageRunner,
}

impl GateStage {
    pub fn new(name: impl Into<String>, template: impl Into<String>, runner: StageRunner) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            runner,
        }
    }

    /// 判定；调用失败时拒绝，原因为 "Screening failed: ..."
    pub async fn screen(&self, ctx: &StageContext) -> StageOutcome<GateVerdict> {
        let prompt = ctx.render(&self.template);
        let parsed = self
            .runner
            .structured(
                &self.name,
                &prompt,
                GateVerdict::reject("Screening failed: unparseable verdict"),
            )
            .await;

        let verdict = match &parsed.failure {
            Some(StageFailure::Call(e)) => GateVerdict::reject(format!("Screening failed: {e}")),
            _ => parsed.value,
        };
        tracing::info!(
            stage = %self.name,
            decision = verdict.decision(),
            reason = %verdict.reason,
            "gate verdict"
        );

        let outcome = if verdict.accept {
            StageOutcome::proceed(verdict, parsed.usage)
        } else {
            StageOutcome::stop(verdict, parsed.usage)
        };
        outcome.with_failure(parsed.failure)
    }
}

#[async_trait]
impl Stage for GateStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> StageOutcome<Value> {
        let outcome = self.screen(ctx).await;
        StageOutcome {
            output: outcome.output.to_value(),
            usage: outcome.usage,
            proceed: outcome.proceed,
            failure: outcome.failure,
        }
    }
}
