//! Tests for daemon configuration: defaults, validation, file loading and
//! override precedence.

#[cfg(test)]
mod global_config_tests {
    use crate::config::global::{GlobalConfig, LoggingConfig, RuntimeConfig};

    #[test]
    fn test_global_default_valid() {
        assert!(GlobalConfig::default().validate().is_ok());
    }

    #[test]
    fn test_runtime_worker_bounds() {
        assert!(RuntimeConfig { worker_threads: 1 }.validate().is_ok());
        for workers in [0, RuntimeConfig::MAX_WORKER_THREADS + 1] {
            let err = RuntimeConfig {
                worker_threads: workers,
            }
            .validate()
            .unwrap_err();
            assert!(err.starts_with("global.runtime.worker_threads"));
        }
    }

    #[test]
    fn test_logging_filter_directives() {
        let config = LoggingConfig {
            filter: "warn,flowdivert=trace".to_string(),
            ..LoggingConfig::default()
        };
        assert!(config.validate().is_ok());

        let bad = LoggingConfig {
            filter: "flowdivert=loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(bad.validate().unwrap_err().contains("global.logging.filter"));
    }
}

#[cfg(test)]
mod daemon_config_tests {
    use crate::config::DaemonConfig;

    #[test]
    fn test_default_valid() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn test_collects_engine_and_global_errors() {
        let mut config = DaemonConfig::default();
        config.engine.chunk_size = 0;
        config.global.runtime.worker_threads = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.starts_with("engine.chunk_size")));
        assert!(errors.iter().any(|e| e.starts_with("global.runtime.worker_threads")));
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&DaemonConfig::default()).unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine, DaemonConfig::default().engine);
        assert_eq!(parsed.global.logging, DaemonConfig::default().global.logging);
    }
}

#[cfg(test)]
mod loader_tests {
    use crate::config::loader::{apply_env_overrides, load_config_file, resolve, CliArgs};
    use crate::config::DaemonConfig;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.engine, DaemonConfig::default().engine);
    }

    #[test]
    fn test_partial_file() {
        let file = write_config(
            r#"
            [global.logging]
            filter = "debug"

            [global.channels]
            provider_link_capacity = 64

            [engine]
            max_key_size = 512
            "#,
        );
        let config = load_config_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.global.logging.filter, "debug");
        assert!(config.global.logging.ansi);
        assert_eq!(config.global.channels.provider_link_capacity, 64);
        assert_eq!(config.global.channels.dispatcher_capacity, 4096);
        assert_eq!(config.engine.max_key_size, 512);
        assert_eq!(config.engine.chunk_size, 4096);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let file = write_config("[engine\nchunk_size = ");
        let err = load_config_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse TOML config"));
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let file = write_config("[global.channels]\nprovider_link_capacity = 2\n");
        let cli = CliArgs {
            config: file.path().to_str().unwrap().to_string(),
            ..CliArgs::default()
        };
        let err = resolve(&cli).unwrap_err();
        assert!(err.to_string().contains("provider_link_capacity"));
    }

    #[test]
    fn test_cli_log_filter_beats_file() {
        let file = write_config("[global.logging]\nfilter = \"warn\"\n");
        let cli = CliArgs {
            config: file.path().to_str().unwrap().to_string(),
            log_filter: Some("flowdivert=trace".to_string()),
            ..CliArgs::default()
        };
        let config = resolve(&cli).unwrap();
        assert_eq!(config.global.logging.filter, "flowdivert=trace");
    }

    #[test]
    fn test_invalid_cli_log_filter_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cli = CliArgs {
            config: dir.path().join("absent.toml").to_str().unwrap().to_string(),
            log_filter: Some("flowdivert=loud".to_string()),
            ..CliArgs::default()
        };
        let err = resolve(&cli).unwrap_err();
        assert!(err.to_string().contains("global.logging.filter"));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("FLOWDIVERTD_ENGINE__CHUNK_SIZE", "8192");
        std::env::set_var("FLOWDIVERTD_ENGINE__REQUIRE_TOKEN_HMAC", "false");

        let mut config = DaemonConfig::default();
        let result = apply_env_overrides(&mut config);

        std::env::remove_var("FLOWDIVERTD_ENGINE__CHUNK_SIZE");
        std::env::remove_var("FLOWDIVERTD_ENGINE__REQUIRE_TOKEN_HMAC");

        result.unwrap();
        assert_eq!(config.engine.chunk_size, 8192);
        assert!(!config.engine.require_token_hmac);
    }
}
