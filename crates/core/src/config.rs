use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{Framing, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RECV_BUFFER_SIZE};
use crate::traits::BridgeError;

/// Manager-wide settings. Publishers and subscribers that talk to each other
/// must agree on `framing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Wire framing for every socket the manager creates.
    pub framing: Framing,
    /// Bytes read per receive call.
    pub recv_buffer_size: usize,
    /// Upper bound on a single length-prefixed frame.
    pub max_frame_size: usize,
    /// How long a subscriber waits for its TCP handshake.
    pub connect_timeout_ms: u64,
    /// Drop messages whose topic matches no subscribed prefix.
    pub topic_filtering: bool,
    /// Disable Nagle on peer and subscriber connections.
    pub nodelay: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Delimited,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_ms: 1000,
            topic_filtering: false,
            nodelay: true,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, BridgeError> {
        let config: Self =
            toml::from_str(s).map_err(|e| BridgeError::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!(path = %path.display(), ?config, "Loaded bridge config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.recv_buffer_size == 0 {
            return Err(BridgeError::Config("recv_buffer_size must be > 0".to_string()));
        }
        if self.max_frame_size == 0 {
            return Err(BridgeError::Config("max_frame_size must be > 0".to_string()));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(BridgeError::Config(
                "max_frame_size must fit a 32-bit length prefix".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BridgeError::Config("connect_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
