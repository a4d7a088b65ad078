//! Configuration loading and parsing.
//!
//! Precedence, lowest first: defaults, TOML file, `FLOWDIVERTD_*`
//! environment variables, command-line flags.

use anyhow::{Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use std::path::Path;

use super::DaemonConfig;

/// Command-line interface for the daemon.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "flowdivertd.toml")]
    pub config: String,

    /// Log filter directives (overrides config file)
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Parse the command line and load the daemon configuration.
///
/// `--print-default-config` and `--validate` exit the process once done.
pub fn load_config() -> Result<DaemonConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let config = resolve(&cli)?;

    if cli.validate {
        println!("configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// Build and validate the configuration described by `cli`.
pub fn resolve(cli: &CliArgs) -> Result<DaemonConfig> {
    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config)?;
    apply_cli_overrides(&mut config, cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;
    Ok(config)
}

/// Load configuration from a TOML file; a missing file means defaults.
pub(crate) fn load_config_file(path: &str) -> Result<DaemonConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(
            config_path = %path,
            "Configuration file not found, using defaults"
        );
        return Ok(DaemonConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    toml::from_str(&config_str).with_context(|| format!("Failed to parse TOML config: {}", path))
}

/// Apply environment variable overrides.
///
/// Variables are prefixed with `FLOWDIVERTD_` and use `__` as a separator:
///
/// - `FLOWDIVERTD_GLOBAL__LOGGING__FILTER=debug`
/// - `FLOWDIVERTD_ENGINE__CHUNK_SIZE=8192`
/// - `FLOWDIVERTD_ENGINE__REQUIRE_TOKEN_HMAC=false`
pub(crate) fn apply_env_overrides(config: &mut DaemonConfig) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(
            config::Environment::with_prefix("FLOWDIVERTD")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(filter) = env_config.get_string("global.logging.filter") {
        config.global.logging.filter = filter;
    }
    if let Ok(threads) = env_config.get_int("global.runtime.worker_threads") {
        config.global.runtime.worker_threads = usize::try_from(threads)
            .context("global.runtime.worker_threads must not be negative")?;
    }
    if let Ok(capacity) = env_config.get_int("global.channels.provider_link_capacity") {
        config.global.channels.provider_link_capacity = usize::try_from(capacity)
            .context("global.channels.provider_link_capacity must not be negative")?;
    }
    if let Ok(chunk) = env_config.get_int("engine.chunk_size") {
        config.engine.chunk_size =
            usize::try_from(chunk).context("engine.chunk_size must not be negative")?;
    }
    if let Ok(require) = env_config.get_bool("engine.require_token_hmac") {
        config.engine.require_token_hmac = require;
    }

    Ok(())
}

fn apply_cli_overrides(config: &mut DaemonConfig, cli: &CliArgs) {
    if let Some(filter) = &cli.log_filter {
        config.global.logging.filter = filter.clone();
    }
}

fn print_default_config() -> Result<()> {
    let toml_str = toml::to_string_pretty(&DaemonConfig::default())
        .context("Failed to serialize default config")?;
    println!("{}", toml_str);
    Ok(())
}
