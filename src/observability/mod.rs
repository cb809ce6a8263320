//! 可观测性：日志初始化与过程事件日志

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::react::AgentEvent;

/// 默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 消费事件流并逐条写成 JSON 日志；发送端全部关闭后任务结束
pub fn spawn_event_logger(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(event) = rx.recv().await {
            count += 1;
            match serde_json::to_string(&event) {
                Ok(line) => tracing::info!(event = %line, "agent"),
                Err(e) => tracing::warn!(error = %e, "failed to serialize agent event"),
            }
        }
        count
    })
}
