use serde::{Deserialize, Serialize};

/// Telemetry configuration.
///
/// Engine events are counted in-process and reported as a periodic
/// structured log line.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to every metrics report.
    pub service_name: String,

    /// Count engine events and report them (default: true).
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Seconds between metrics reports (default: 60).
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_report_interval() -> u64 {
    60
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "flowdivertd".to_string(),
            enable_metrics: true,
            report_interval_secs: default_report_interval(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enable_metrics && self.report_interval_secs == 0 {
            return Err("telemetry.report_interval_secs must be > 0".to_string());
        }
        Ok(())
    }
}
