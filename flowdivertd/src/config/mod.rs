//! Daemon configuration.
//!
//! Global host settings (logging, runtime, hub channels, telemetry) sit
//! next to the engine's own [`EngineConfig`], which is passed through to
//! the core untouched.
//!
//! # Example
//!
//! ```toml
//! [global.logging]
//! filter = "info,flowdivert=debug"
//!
//! [global.channels]
//! provider_link_capacity = 1024
//!
//! [engine]
//! chunk_size = 4096
//! require_token_hmac = true
//! ```

pub mod global;
pub mod loader;

#[cfg(test)]
mod tests;

pub use global::{GlobalConfig, LoggingConfig, RuntimeConfig};
pub use loader::{load_config, CliArgs};

use flowdivert::EngineConfig;
use serde::{Deserialize, Serialize};

/// Everything the daemon reads at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub global: GlobalConfig,
    pub engine: EngineConfig,
}

impl DaemonConfig {
    /// Validate host and engine settings, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.global.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.engine.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
