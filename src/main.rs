//! Consensus - 无头运行入口
//!
//! `consensus <task...>`：初始化日志、加载配置、跑一次完整编排，把 RunResult 以 JSON 打印到标准输出。
//! Ctrl-C 在阶段之间取消运行，仍输出结构完整的结果。

use anyhow::Context;
use consensus::config::{load_config, AppConfig};
use consensus::core::{create_llm_from_config, OrchestratorBuilder};
use consensus::observability;
use consensus::tools::EchoTool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        anyhow::bail!("usage: consensus <task...>");
    }

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let llm = create_llm_from_config(&cfg);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let logger = observability::spawn_event_logger(event_rx);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling after the current stage");
            on_signal.cancel();
        }
    });

    let orchestrator = OrchestratorBuilder::new(cfg)
        .with_tool(EchoTool)
        .with_events(event_tx)
        .with_cancel_token(cancel)
        .build(llm);

    let result = orchestrator.run(&task).await;
    drop(orchestrator);
    let events = logger.await.context("Event logger task failed")?;
    tracing::debug!(events, "event stream closed");

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize run result")?;
    println!("{json}");
    Ok(())
}
