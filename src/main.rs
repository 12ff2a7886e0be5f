//! AuthPilot worker
//!
//! 入口：初始化日志、加载配置、装配运行时，执行启动清理并运行后台维护任务，
//! 收到 Ctrl+C / SIGTERM 后取消任务并释放本进程持有的会话锁。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use authpilot::config::load_config;
use authpilot::core::{HeldLockCleanup, ShutdownCoordinator, ShutdownManager};
use authpilot::maintenance::{spawn_maintenance, startup_cleanup};
use authpilot::runtime::RuntimeBuilder;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    let runtime = RuntimeBuilder::new(config)
        .build()
        .context("Failed to assemble runtime")?;

    startup_cleanup(&runtime).await;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let handles = spawn_maintenance(&runtime, shutdown.token());
    tracing::info!(tasks = handles.len(), "authpilot worker running");

    shutdown.wait_for_shutdown().await;
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("maintenance task ended abnormally: {}", e);
        }
    }

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(HeldLockCleanup::new(runtime.locks.clone()));
    coordinator.run_cleanup().await;

    Ok(())
}
