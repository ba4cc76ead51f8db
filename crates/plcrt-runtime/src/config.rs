//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::image::HEADER_SIZE;
use crate::io::IoLayout;

/// Runtime configuration, loadable from TOML. Every field has a
/// default matching the original firmware configuration, so an empty
/// file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Staging buffer capacity for file-loaded module images, in bytes.
    pub staging_capacity: usize,
    /// Trace ring buffer capacity in bytes.
    pub ring_capacity: usize,
    /// Maximum number of simultaneously traced variables.
    pub max_traced: usize,
    /// Trace session liveness timeout in milliseconds.
    pub session_timeout_ms: u64,
    /// Upper bound on the fetch drain poll in milliseconds.
    pub fetch_poll_ms: u64,
    /// Tick wraps to 1 after reaching this value; 0 disables wrapping.
    pub tick_modulus: u32,
    /// Load and start the configured module file at startup.
    pub autostart: bool,
    /// Default staged module file.
    pub module_file: Option<PathBuf>,
    /// Messages retained per level in the RTE log.
    pub rte_log_retain: usize,
    /// Process image point counts.
    pub io: IoLayout,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 64 * 1024,
            ring_capacity: 8192,
            max_traced: 64,
            session_timeout_ms: 3000,
            fetch_poll_ms: 500,
            tick_modulus: 0,
            autostart: false,
            module_file: None,
            rte_log_retain: 32,
            io: IoLayout::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path).map_err(|err| RuntimeError::storage(&err))?;
        let config: Self = toml::from_str(&text)
            .map_err(|err| RuntimeError::InvalidConfig(err.to_string().into()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.staging_capacity <= HEADER_SIZE {
            return Err(RuntimeError::InvalidConfig(
                "staging_capacity must exceed the image header size".into(),
            ));
        }
        if self.ring_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "ring_capacity must be nonzero".into(),
            ));
        }
        if self.max_traced == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_traced must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Trace session liveness timeout.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Upper bound on the fetch drain poll.
    #[must_use]
    pub fn fetch_poll_limit(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.ring_capacity, 8192);
        assert_eq!(config.max_traced, 64);
        assert_eq!(config.session_timeout(), Duration::from_secs(3));
        assert!(!config.autostart);
        config.validate().unwrap();
    }

    #[test]
    fn overrides_are_applied() {
        let config: RuntimeConfig = toml::from_str(
            "ring_capacity = 256\ntick_modulus = 100\n\n[io]\ncoils = 4\n",
        )
        .unwrap();
        assert_eq!(config.ring_capacity, 256);
        assert_eq!(config.tick_modulus, 100);
        assert_eq!(config.io.coils, 4);
        assert_eq!(config.io.input_words, 8);
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let config = RuntimeConfig {
            ring_capacity: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }
}
