//! # Telemetry and Observability
//!
//! Structured logging plus event-driven metrics for the daemon.
//!
//! ## Architecture
//!
//! 1. **Hot path**: the engine reports [`flowdivert::EngineEvent`]s to a
//!    [`MetricsObserver`], which forwards them as fire-and-forget
//!    [`MetricsEvent`]s over a global channel.
//! 2. **Metrics task**: a tokio task folds events into counters and logs a
//!    snapshot every `report_interval_secs`.
//! 3. **Logging**: `tracing-subscriber` with an `EnvFilter`; `RUST_LOG`
//!    overrides the configured directives.

pub mod config;
pub mod metrics;

pub use config::TelemetryConfig;
pub use metrics::{
    record_metric, start_metrics_task, MetricsEvent, MetricsHandle, MetricsObserver,
    MetricsSnapshot,
};

use crate::config::LoggingConfig;
use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Start metrics collection if enabled.
pub fn init_telemetry(
    config: &TelemetryConfig,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<MetricsHandle> {
    let metrics_handle = if config.enable_metrics {
        tracing::info!(
            service = %config.service_name,
            interval_secs = config.report_interval_secs,
            "Starting metrics collection"
        );
        start_metrics_task(config, runtime_handle)?
    } else {
        tracing::warn!("Metrics collection is disabled");
        MetricsHandle::disabled()
    };

    Ok(metrics_handle)
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.env_filter().map_err(anyhow::Error::msg)?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(config.ansi)
        .with_line_number(true)
        .with_file(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    tracing::info!(filter = %config.filter, "Logging initialized");
    Ok(())
}
