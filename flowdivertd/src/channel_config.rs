//! Hub channel sizing.
//!
//! Each provider gets one bounded link carrying engine messages to it; all
//! providers share one bounded queue into the dispatcher. A full provider
//! link is what the engine sees as a blocked control channel.

use serde::{Deserialize, Serialize};

/// Channel capacity configuration, in messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Capacity of each engine → provider link.
    ///
    /// When a link is full the engine queues control messages on the group
    /// and holds data in the flows' send buffers until the provider reads.
    ///
    /// Default: 1024
    #[serde(default = "default_provider_link_capacity")]
    pub provider_link_capacity: usize,

    /// Capacity of the shared provider → dispatcher queue.
    ///
    /// Providers block on send once it is full.
    ///
    /// Default: 4096
    #[serde(default = "default_dispatcher_capacity")]
    pub dispatcher_capacity: usize,
}

fn default_provider_link_capacity() -> usize {
    1024
}

fn default_dispatcher_capacity() -> usize {
    4096
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            provider_link_capacity: default_provider_link_capacity(),
            dispatcher_capacity: default_dispatcher_capacity(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.provider_link_capacity < 16 {
            return Err("provider_link_capacity must be at least 16".to_string());
        }
        if self.dispatcher_capacity < 64 {
            return Err("dispatcher_capacity must be at least 64".to_string());
        }

        if self.dispatcher_capacity > 1_000_000 {
            tracing::warn!(
                capacity = self.dispatcher_capacity,
                "dispatcher_capacity is very large, may use excessive memory"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ChannelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_too_small() {
        let config = ChannelConfig {
            provider_link_capacity: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ChannelConfig {
            dispatcher_capacity: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ChannelConfig = toml::from_str("provider_link_capacity = 32").unwrap();
        assert_eq!(config.provider_link_capacity, 32);
        assert_eq!(config.dispatcher_capacity, 4096);
    }
}
