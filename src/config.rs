//! Runtime knobs for the control plane.
//!
//! Loading and migrating the host's configuration file happens elsewhere; this
//! module only describes the control-plane section and validates it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{ENVELOPE_HEADER_LEN, ENVELOPE_OVERHEAD, MESSAGE_HEADER_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid control config: {0}")]
    Parse(String),
    #[error("keepalive timeout must be non-zero")]
    ZeroKeepalive,
    #[error("keepalive check interval must be between 1 ms and the keepalive timeout")]
    CheckInterval,
    #[error("max datagram size {0} cannot hold an empty envelope")]
    DatagramTooSmall(usize),
    #[error("outbound queue depth must be non-zero")]
    ZeroQueue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Session ends when no authenticated traffic arrives for this long.
    pub keepalive_timeout_ms: u64,
    /// How often the dispatch loop checks the keepalive deadline.
    pub keepalive_check_ms: u64,
    pub max_datagram_size: usize,
    /// Capacity of each session's device-feedback queue.
    pub outbound_queue_depth: usize,
    /// Optional per-recv deadline applied to UDP transports.
    pub recv_timeout_ms: Option<u64>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout_ms: 1_000,
            keepalive_check_ms: 100,
            max_datagram_size: 1_500,
            outbound_queue_depth: 64,
            recv_timeout_ms: None,
        }
    }
}

impl ControlConfig {
    /// Parses and validates a JSON document; absent fields keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_timeout_ms == 0 {
            return Err(ConfigError::ZeroKeepalive);
        }
        if self.keepalive_check_ms == 0 || self.keepalive_check_ms > self.keepalive_timeout_ms {
            return Err(ConfigError::CheckInterval);
        }
        if self.max_datagram_size < ENVELOPE_HEADER_LEN + ENVELOPE_OVERHEAD + MESSAGE_HEADER_LEN {
            return Err(ConfigError::DatagramTooSmall(self.max_datagram_size));
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        Ok(())
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn keepalive_check(&self) -> Duration {
        Duration::from_millis(self.keepalive_check_ms)
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout_ms.map(Duration::from_millis)
    }
}
