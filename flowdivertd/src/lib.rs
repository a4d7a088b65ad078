//! flowdivertd: host process for the flow-divert engine.
//!
//! Loads configuration, installs logging and metrics, and runs the engine
//! behind an in-process hub that providers attach to. The `flowdivertd`
//! binary is in main.rs; the modules are public so embedders and tests can
//! assemble the same pieces.

pub mod channel_config;
pub mod config;
pub mod daemon;
pub mod hub;
pub mod runtime;
pub mod telemetry;

pub use daemon::Daemon;
