use anyhow::Context;
use flowdivertd::telemetry::{self, MetricsObserver};
use flowdivertd::{config, runtime, Daemon};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    telemetry::init_logging(&config.global.logging)?;
    info!("Configuration loaded successfully");

    let tokio_runtime = runtime::build_runtime(&config.global.runtime)
        .with_context(|| "failed to create tokio runtime")?;
    let runtime_handle = tokio_runtime.handle().clone();

    let metrics_handle = telemetry::init_telemetry(&config.global.telemetry, &runtime_handle)
        .with_context(|| "failed to initialize telemetry")?;

    let daemon = Daemon::start(&config, Arc::new(MetricsObserver))
        .with_context(|| "failed to start flow-divert engine")?;

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = Arc::clone(&shutdown_notify);

    tokio_runtime.spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Shutdown signal received");
        shutdown_notify_clone.notify_one();
    });

    tokio_runtime.block_on(async {
        shutdown_notify.notified().await;
    });

    info!("Initiating graceful shutdown");
    daemon.shutdown();

    tokio_runtime.block_on(async {
        metrics_handle.shutdown().await;
    });

    tokio_runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    info!("Shutdown complete");
    Ok(())
}
