// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent configuration with validation.
//!
//! Every field has a default so a partial TOML file is enough:
//!
//! ```toml
//! window_size = 8
//! retransmit_timeout_ms = 250
//! session_idle_timeout_ms = 60000
//!
//! [frame_size]
//! udp = 512
//! serial = 64
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportKind;

/// Largest window the 16-bit ACKNACK bitmap can describe.
pub const MAX_WINDOW_SIZE: u16 = 16;

/// Smallest frame that still fits a header, a FRAGMENT submessage header
/// and one byte of payload.
pub const MIN_FRAME_SIZE: usize = 16;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Maximum frame size per transport kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSizeConfig {
    /// UDP datagram budget (default: 512, typical MCU limit).
    #[serde(default = "default_udp_frame")]
    pub udp: usize,
    /// TCP frame budget (default: 4096).
    #[serde(default = "default_tcp_frame")]
    pub tcp: usize,
    /// Serial frame budget (default: 64).
    #[serde(default = "default_serial_frame")]
    pub serial: usize,
}

impl Default for FrameSizeConfig {
    fn default() -> Self {
        Self {
            udp: default_udp_frame(),
            tcp: default_tcp_frame(),
            serial: default_serial_frame(),
        }
    }
}

/// Configuration for the XRCE agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// UDP bind address (default: 0.0.0.0:2019, the XRCE standard port).
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Maximum unacknowledged fragments per reliable stream (1..=16).
    #[serde(default = "default_window_size")]
    pub window_size: u16,

    /// Heartbeat period for reliable output streams.
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_ms: u64,

    /// Period for flushing pending acknowledgements on reliable input streams.
    #[serde(default = "default_acknack_period")]
    pub acknack_period_ms: u64,

    /// Retransmit deadline for an unacknowledged fragment.
    #[serde(default = "default_retransmit_timeout")]
    pub retransmit_timeout_ms: u64,

    /// Timer-driven retransmissions allowed per fragment before the stream
    /// reports the peer unresponsive.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Partial fragmented messages older than this are discarded.
    #[serde(default = "default_reassembly_timeout")]
    pub reassembly_timeout_ms: u64,

    /// Sessions with no inbound traffic for this long are evicted.
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_ms: u64,

    /// Create sessions for unknown identities on first contact.
    #[serde(default = "default_true")]
    pub implicit_session_creation: bool,

    /// Upper bound for concurrent sessions (default admission policy).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Frames queued behind a full reliable send window.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Inbound datagrams buffered per session worker.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,

    /// Largest logical message after reassembly.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-transport frame budget.
    #[serde(default)]
    pub frame_size: FrameSizeConfig,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2019))
}

fn default_window_size() -> u16 {
    MAX_WINDOW_SIZE
}

fn default_heartbeat_period() -> u64 {
    200
}

fn default_acknack_period() -> u64 {
    100
}

fn default_retransmit_timeout() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    8
}

fn default_reassembly_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    128
}

fn default_send_queue_capacity() -> usize {
    64
}

fn default_session_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_udp_frame() -> usize {
    512
}

fn default_tcp_frame() -> usize {
    4096
}

fn default_serial_frame() -> usize {
    64
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            window_size: default_window_size(),
            heartbeat_period_ms: default_heartbeat_period(),
            acknack_period_ms: default_acknack_period(),
            retransmit_timeout_ms: default_retransmit_timeout(),
            max_retries: default_max_retries(),
            reassembly_timeout_ms: default_reassembly_timeout(),
            session_idle_timeout_ms: default_idle_timeout(),
            implicit_session_creation: true,
            max_sessions: default_max_sessions(),
            send_queue_capacity: default_send_queue_capacity(),
            session_queue_capacity: default_session_queue_capacity(),
            max_message_size: default_max_message_size(),
            frame_size: FrameSizeConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Returns Ok(()) if valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "window_size must be in 1..={} (acknack bitmap width)",
                MAX_WINDOW_SIZE
            )));
        }
        for (name, value) in [
            ("heartbeat_period_ms", self.heartbeat_period_ms),
            ("acknack_period_ms", self.acknack_period_ms),
            ("retransmit_timeout_ms", self.retransmit_timeout_ms),
            ("reassembly_timeout_ms", self.reassembly_timeout_ms),
            ("session_idle_timeout_ms", self.session_idle_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be > 0".into()));
        }
        if self.session_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session_queue_capacity must be > 0".into(),
            ));
        }
        for (name, size) in [
            ("frame_size.udp", self.frame_size.udp),
            ("frame_size.tcp", self.frame_size.tcp),
            ("frame_size.serial", self.frame_size.serial),
        ] {
            if size < MIN_FRAME_SIZE || size > usize::from(u16::MAX) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in {}..=65535",
                    name, MIN_FRAME_SIZE
                )));
            }
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be > 0".into()));
        }
        Ok(())
    }

    /// Frame budget for the given transport kind.
    pub fn max_frame_size(&self, kind: TransportKind) -> usize {
        match kind {
            TransportKind::Udp | TransportKind::Memory => self.frame_size.udp,
            TransportKind::Tcp => self.frame_size.tcp,
            TransportKind::Serial => self.frame_size.serial,
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn acknack_period(&self) -> Duration {
        Duration::from_millis(self.acknack_period_ms)
    }

    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    /// Per-stream settings derived from this configuration.
    pub fn stream_config(&self, kind: TransportKind) -> StreamConfig {
        StreamConfig {
            window_size: self.window_size,
            heartbeat_period: self.heartbeat_period(),
            acknack_period: self.acknack_period(),
            retransmit_timeout: self.retransmit_timeout(),
            max_retries: self.max_retries,
            reassembly_timeout: self.reassembly_timeout(),
            send_queue_capacity: self.send_queue_capacity,
            max_message_size: self.max_message_size,
            max_frame_size: self.max_frame_size(kind),
        }
    }
}

/// Stream-level settings shared by every stream of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub window_size: u16,
    pub heartbeat_period: Duration,
    pub acknack_period: Duration,
    pub retransmit_timeout: Duration,
    pub max_retries: u32,
    pub reassembly_timeout: Duration,
    pub send_queue_capacity: usize,
    pub max_message_size: usize,
    pub max_frame_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        AgentConfig::default().stream_config(TransportKind::Udp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address.port(), 2019);
        assert_eq!(config.window_size, 16);
        assert!(config.implicit_session_creation);
    }

    #[test]
    fn test_window_size_bounds() {
        let mut config = AgentConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.window_size = 17;
        assert!(config.validate().is_err());
        config.window_size = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let config = AgentConfig {
            retransmit_timeout_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retransmit_timeout_ms"));
    }

    #[test]
    fn test_frame_size_bounds() {
        let config = AgentConfig {
            frame_size: FrameSizeConfig {
                serial: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config = AgentConfig::from_toml_str(
            r#"
            window_size = 4
            max_retries = 3
            implicit_session_creation = false

            [frame_size]
            serial = 128
            "#,
        )
        .expect("parse");
        assert_eq!(config.window_size, 4);
        assert_eq!(config.max_retries, 3);
        assert!(!config.implicit_session_creation);
        assert_eq!(config.frame_size.serial, 128);
        assert_eq!(config.frame_size.udp, 512);
        assert_eq!(config.max_frame_size(TransportKind::Serial), 128);
        assert_eq!(config.heartbeat_period(), Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(matches!(
            AgentConfig::from_toml_str("window_size = 99"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AgentConfig::from_toml_str("window_size = \"x\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "session_idle_timeout_ms = 1000\n").expect("write");
        let config = AgentConfig::from_file(&path).expect("load");
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_stream_config_uses_transport_frame_size() {
        let config = AgentConfig::default();
        let sc = config.stream_config(TransportKind::Serial);
        assert_eq!(sc.max_frame_size, 64);
        assert_eq!(sc.window_size, 16);
    }

    #[test]
    fn test_serialization() {
        let config = AgentConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        assert!(toml_str.contains("window_size = 16"));
        let back = AgentConfig::from_toml_str(&toml_str).expect("parse back");
        assert_eq!(back, config);
    }
}
