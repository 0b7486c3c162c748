//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds an invite rings before timing out
    pub ring_timeout_secs: u64,
    /// Seconds a lost session may take to recover before it fails
    pub failure_grace_secs: u64,
    /// Seconds from session creation to first connectivity
    pub negotiation_timeout_secs: u64,
    /// UI command queue capacity
    pub command_capacity: usize,
    /// Event broadcast capacity
    pub event_capacity: usize,
    /// STUN/TURN server URLs for WebRTC links
    pub ice_servers: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            failure_grace_secs: 10,
            negotiation_timeout_secs: 30,
            command_capacity: 64,
            event_capacity: 256,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a JSON config file
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded orchestrator config");
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error if a timeout or capacity is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("ring_timeout_secs", self.ring_timeout_secs as usize),
            ("failure_grace_secs", self.failure_grace_secs as usize),
            ("negotiation_timeout_secs", self.negotiation_timeout_secs as usize),
            ("command_capacity", self.command_capacity),
            ("event_capacity", self.event_capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Ring timeout
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// Failure grace window
    #[must_use]
    pub fn failure_grace(&self) -> Duration {
        Duration::from_secs(self.failure_grace_secs)
    }

    /// Negotiation deadline
    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}
