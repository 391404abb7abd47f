//! Hive - 执行连续性引擎
//!
//! 入口：加载配置、初始化日志、装配引擎，路由一条请求并以 JSON 输出结果与统计。
//! 用法：`hive "<request>"`；Ctrl+C 触发优雅关闭。

use std::sync::Arc;

use anyhow::Context;
use hive::core::{create_engine_builder, ExecutionCleanup, ShutdownCoordinator, ShutdownManager};
use hive::router::RouterRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let text = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("usage: hive \"<request>\"");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    let builder = create_engine_builder(None);
    let cleanup_timeout = builder.config().shutdown.cleanup_timeout_secs;
    let engine = builder
        .with_echo_tools(true)
        .with_shutdown_token(shutdown.token())
        .build();

    let reap_every = engine.controller.settings().reap_after / 2;
    let _reaper = engine.controller.spawn_reaper(reap_every);

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(cleanup_timeout);
    coordinator.register(ExecutionCleanup::new(Arc::clone(&engine.controller)));

    shutdown.install_signal_handlers();
    let response = tokio::select! {
        response = engine.router.handle(RouterRequest::new(text)) => Some(response),
        _ = shutdown.wait_for_shutdown() => None,
    };

    if let Some(response) = response {
        let stats = engine.controller.get_stats().await;
        let out = serde_json::json!({ "response": response, "stats": stats });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialize response")?
        );
    } else {
        tracing::warn!("Interrupted before the request finished");
    }

    coordinator.run_cleanup().await;
    Ok(())
}
