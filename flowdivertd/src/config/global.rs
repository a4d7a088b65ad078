//! Global daemon configuration.
//!
//! Settings that apply to the whole host process, independent of any
//! provider: logging, the async runtime, hub channel sizing and telemetry.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Global daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub logging: LoggingConfig,

    pub runtime: RuntimeConfig,

    /// Hub channel capacities
    pub channels: crate::channel_config::ChannelConfig,

    pub telemetry: crate::telemetry::TelemetryConfig,
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.logging.validate() {
            errors.push(e);
        }

        if let Err(e) = self.runtime.validate() {
            errors.push(e);
        }

        if let Err(e) = self.channels.validate() {
            errors.push(e);
        }

        if let Err(e) = self.telemetry.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Runtime hosting the metrics task and signal handling.
///
/// Provider traffic never runs here; it has its own dispatcher thread, so
/// the only knob is the worker count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// **Default:** 2
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

impl RuntimeConfig {
    pub const MAX_WORKER_THREADS: usize = 64;

    pub fn validate(&self) -> Result<(), String> {
        if self.worker_threads == 0 || self.worker_threads > Self::MAX_WORKER_THREADS {
            return Err(format!(
                "global.runtime.worker_threads must be between 1 and {}",
                Self::MAX_WORKER_THREADS
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directives, e.g. `"info,flowdivert=debug"`.
    /// `RUST_LOG` takes precedence when set.
    ///
    /// **Default:** `"info"`
    pub filter: String,

    /// Colored output.
    ///
    /// **Default:** `true`
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Parse the filter directives.
    pub fn env_filter(&self) -> Result<EnvFilter, String> {
        EnvFilter::try_new(&self.filter)
            .map_err(|e| format!("global.logging.filter {:?} is invalid: {}", self.filter, e))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.env_filter().map(|_| ())
    }
}
