//! Link configuration
//!
//! Every tuning value is an explicit field passed into the component that
//! uses it; nothing is read from process-wide state. Defaults follow the
//! values the SmartMotor boards shipped with.
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};
use crate::{DEFAULT_PORT, MAX_FRAME_SIZE_LIMIT, MIN_FRAME_SIZE};

/// Complete configuration for one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub session: SessionConfig,
    pub filter: FilterConfig,
    pub protocol: ProtocolConfig,
    pub transport: TransportConfig,
    pub controller: ControllerConfig,
    pub receiver: ReceiverConfig,
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: LinkConfig = toml::from_str(&content).map_err(|e| {
            LinkError::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| LinkError::config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            LinkError::config(format!("failed to write {}: {}", path.display(), e))
        })
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.filter.validate()?;
        self.protocol.validate()?;
        self.receiver.validate()?;

        if self.session.heartbeat_interval_ms >= self.session.liveness_timeout_ms {
            return Err(LinkError::config(
                "heartbeat_interval_ms must be shorter than liveness_timeout_ms",
            ));
        }
        if self.controller.sample_interval_ms == 0 {
            return Err(LinkError::config("sample_interval_ms must be non-zero"));
        }
        Ok(())
    }
}

/// Connection lifecycle timing and retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed for transport connect plus handshake
    pub connect_timeout_ms: u64,

    /// Silence tolerated in CONNECTED before probing
    pub liveness_timeout_ms: u64,

    /// Time allowed for the probe to be answered in DEGRADED
    pub probe_timeout_ms: u64,

    /// Keepalive heartbeat period when nothing else is sent
    pub heartbeat_interval_ms: u64,

    /// Consecutive failed connects before FATAL
    pub max_reconnect_attempts: u32,

    /// First reconnect delay
    pub backoff_base_ms: u64,

    /// Reconnect delay ceiling
    pub backoff_cap_ms: u64,

    /// Upper bound on one blocking read (threaded model)
    pub poll_timeout_ms: u64,

    /// Upper bound on completing one frame write
    pub write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            liveness_timeout_ms: 3_000,
            probe_timeout_ms: 2_000,
            heartbeat_interval_ms: 1_000,
            max_reconnect_attempts: 10,
            backoff_base_ms: 500,
            backoff_cap_ms: 10_000,
            poll_timeout_ms: 50,
            write_timeout_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            return Err(LinkError::config("max_reconnect_attempts must be at least 1"));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_cap_ms {
            return Err(LinkError::config(
                "backoff_base_ms must be non-zero and not above backoff_cap_ms",
            ));
        }
        if self.connect_timeout_ms == 0 || self.liveness_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(LinkError::config("timeouts must be non-zero"));
        }
        if self.poll_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(LinkError::config("poll/write timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Dead-zone and rate limiting for outbound sensor values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum change (degrees) before a reading is significant
    pub dead_zone: f32,

    /// Minimum time between two sends
    pub min_interval_ms: u64,

    /// Accumulated change that overrides the interval gate
    pub force_send_threshold: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            dead_zone: 3.0,
            min_interval_ms: 200,
            force_send_threshold: 30.0,
        }
    }
}

impl FilterConfig {
    fn validate(&self) -> Result<()> {
        if !(self.dead_zone >= 0.0) {
            return Err(LinkError::config("dead_zone must be >= 0"));
        }
        if !(self.force_send_threshold >= self.dead_zone) {
            return Err(LinkError::config("force_send_threshold must be >= dead_zone"));
        }
        Ok(())
    }
}

/// Payload bounds and sequence window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Lowest angle a DATA message may carry
    pub angle_min: f32,

    /// Highest angle a DATA message may carry
    pub angle_max: f32,

    /// Largest forward sequence jump accepted as in-order
    pub max_forward_jump: u16,

    /// Longest status text accepted
    pub max_status_len: usize,

    /// Largest encoded frame, header and checksum included
    pub max_frame_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            angle_min: 0.0,
            angle_max: 180.0,
            max_forward_jump: 1024,
            max_status_len: 48,
            max_frame_size: 256,
        }
    }
}

impl ProtocolConfig {
    fn validate(&self) -> Result<()> {
        if !(self.angle_min < self.angle_max) {
            return Err(LinkError::config("angle_min must be below angle_max"));
        }
        if self.max_forward_jump == 0 || self.max_forward_jump >= 0x8000 {
            return Err(LinkError::config(
                "max_forward_jump must be in 1..32768 (half the sequence space)",
            ));
        }
        if self.max_frame_size < MIN_FRAME_SIZE || self.max_frame_size > MAX_FRAME_SIZE_LIMIT {
            return Err(LinkError::config(format!(
                "max_frame_size must be in {}..={}",
                MIN_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT
            )));
        }
        Ok(())
    }
}

/// How the two devices reach each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Receiver listens, controller dials it
    Direct,
    /// Both devices dial a relay hub
    Relay,
}

/// Addresses used to build the connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,

    /// Receiver listen address in direct mode
    pub listen_addr: SocketAddr,

    /// Receiver address the controller dials in direct mode
    pub peer_addr: SocketAddr,

    /// Hub address in relay mode (also the relay's bind address)
    pub relay_addr: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Direct,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            relay_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT + 10)),
        }
    }
}

/// Controller role timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Potentiometer sampling period
    pub sample_interval_ms: u64,

    /// In-flight DATA sequences remembered for round-trip matching
    pub max_in_flight: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 20,
            max_in_flight: 16,
        }
    }
}

/// Receiver role actuator limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Hardware-safe lower bound for the servo
    pub min_angle: f32,

    /// Hardware-safe upper bound for the servo
    pub max_angle: f32,

    /// Position the servo is driven to at startup and shutdown
    pub center_angle: f32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            min_angle: 0.0,
            max_angle: 180.0,
            center_angle: 90.0,
        }
    }
}

impl ReceiverConfig {
    /// Clamp a requested angle into the hardware-safe range
    pub fn clamp(&self, angle: f32) -> f32 {
        angle.clamp(self.min_angle, self.max_angle)
    }

    fn validate(&self) -> Result<()> {
        if !(self.min_angle < self.max_angle) {
            return Err(LinkError::config("receiver min_angle must be below max_angle"));
        }
        if self.center_angle < self.min_angle || self.center_angle > self.max_angle {
            return Err(LinkError::config("center_angle must lie within min/max"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LinkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = LinkConfig::default();
        config.session.backoff_base_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_heartbeat_slower_than_liveness() {
        let mut config = LinkConfig::default();
        config.session.heartbeat_interval_ms = config.session.liveness_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_window_beyond_half_range() {
        let mut config = LinkConfig::default();
        config.protocol.max_forward_jump = 0x8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LinkConfig = toml::from_str(
            r#"
            [filter]
            dead_zone = 5.0

            [transport]
            mode = "relay"
            "#,
        )
        .unwrap();
        assert_eq!(config.filter.dead_zone, 5.0);
        assert_eq!(config.filter.min_interval_ms, 200);
        assert_eq!(config.transport.mode, TransportMode::Relay);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.toml");

        let mut config = LinkConfig::default();
        config.session.max_reconnect_attempts = 4;
        config.save_to_file(&path).unwrap();

        let loaded = LinkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_clamp_to_servo_range() {
        let receiver = ReceiverConfig::default();
        assert_eq!(receiver.clamp(200.0), 180.0);
        assert_eq!(receiver.clamp(-5.0), 0.0);
        assert_eq!(receiver.clamp(45.0), 45.0);
    }
}
