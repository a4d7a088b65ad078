//! Engine configuration.
//!
//! Limits that bound what a provider can make the engine allocate, plus the
//! chunking and buffering knobs of the data path.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! chunk_size = 4096
//! max_trie_memory = 1048576
//! require_token_hmac = true
//! ```

use serde::{Deserialize, Serialize};

/// Hard ceiling on the identity trie arena, whatever the configuration says.
pub const TRIE_MEMORY_CEILING: usize = 16 * 1024 * 1024;

/// Flow-divert engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest payload carried by one DATA message. Larger writes are split.
    ///
    /// **Default:** `4096`
    pub chunk_size: usize,

    /// Memory budget for one group's signing-identity trie, in bytes.
    /// An identity map that would need more is rejected.
    ///
    /// **Default:** `1048576` (1 MiB)
    pub max_trie_memory: usize,

    /// Largest group secret accepted from GROUP_INIT.
    ///
    /// **Default:** `1024`
    pub max_key_size: usize,

    /// Largest target hostname accepted in a connect.
    ///
    /// **Default:** `4096`
    pub max_name_size: usize,

    /// How many flow ids are drawn before giving up on a collision.
    ///
    /// **Default:** `3`
    pub flow_id_attempts: u32,

    /// Reject imported tokens that cannot be verified because the named
    /// group has no secret.
    ///
    /// **Default:** `true`
    pub require_token_hmac: bool,

    /// Bytes of application data a flow may hold before writes are refused.
    ///
    /// **Default:** `262144`
    pub send_buffer_limit: usize,

    /// Bytes of provider data a flow may hold for a full receive buffer
    /// before the flow is reset.
    ///
    /// **Default:** `262144`
    pub recv_pending_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            max_trie_memory: 1024 * 1024,
            max_key_size: 1024,
            max_name_size: 4096,
            flow_id_attempts: 3,
            require_token_hmac: true,
            send_buffer_limit: 256 * 1024,
            recv_pending_limit: 256 * 1024,
        }
    }
}

impl EngineConfig {
    /// Validate engine configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.chunk_size == 0 {
            errors.push("engine.chunk_size must be > 0".to_string());
        }
        if self.chunk_size > u32::MAX as usize {
            errors.push("engine.chunk_size must fit in 32 bits".to_string());
        }
        if self.max_trie_memory > TRIE_MEMORY_CEILING {
            errors.push(format!(
                "engine.max_trie_memory ({}) exceeds ceiling ({})",
                self.max_trie_memory, TRIE_MEMORY_CEILING
            ));
        }
        if self.max_key_size == 0 {
            errors.push("engine.max_key_size must be > 0".to_string());
        }
        if self.flow_id_attempts == 0 {
            errors.push("engine.flow_id_attempts must be > 0".to_string());
        }
        if self.send_buffer_limit < self.chunk_size {
            errors.push(format!(
                "engine.send_buffer_limit ({}) must be >= chunk_size ({})",
                self.send_buffer_limit, self.chunk_size
            ));
        }
        if self.recv_pending_limit == 0 {
            errors.push("engine.recv_pending_limit must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let config = EngineConfig {
            chunk_size: 0,
            flow_id_attempts: 0,
            max_trie_memory: TRIE_MEMORY_CEILING + 1,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str("chunk_size = 1024\n").unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.max_key_size, 1024);
        assert!(config.require_token_hmac);
    }
}
