//! Tokio runtime for telemetry and signal handling.

use crate::config::RuntimeConfig;
use anyhow::{Context, Result};
use tokio::runtime::Runtime;

const THREAD_NAME: &str = "flowdivertd-rt";

/// Build the multi-threaded runtime described by `config`.
pub fn build_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name(THREAD_NAME)
        .enable_all()
        .build()
        .with_context(|| {
            format!(
                "failed to build runtime with {} worker threads",
                config.worker_threads
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_runs_tasks() {
        let config = RuntimeConfig { worker_threads: 1 };
        let rt = build_runtime(&config).unwrap();
        let name = rt.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .unwrap()
        });
        assert_eq!(name.as_deref(), Some(THREAD_NAME));
    }
}
