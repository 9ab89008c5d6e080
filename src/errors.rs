//! Error types for SmartMotor link operations
//!
//! The taxonomy follows how far a failure is allowed to travel:
//! - transport faults tear down the current connection and trigger a reconnect
//! - protocol and frame errors reject a single message and keep the session
//! - hardware faults are reported upward and logged, never fatal to the link
use std::io;

use thiserror::Error;

use crate::contracts::MessageKind;
use crate::session::LinkState;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Top-level link error
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// Read/write/connect failure on the underlying transport
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// Message rejected by the protocol layer
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Frame failed structural checks
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    /// Sensor, actuator or display collaborator failed
    #[error("hardware fault: {0}")]
    Hardware(#[from] HardwareError),

    /// Send attempted in a state that does not allow it
    #[error("link not connected (state: {0})")]
    NotConnected(LinkState),

    /// Reconnect ceiling reached; requires a manual restart
    #[error("link is FATAL: {0}")]
    Fatal(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// rkyv serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Thread or async runtime could not be started
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl LinkError {
    /// Whether this error should tear down the current connection
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::TransportFault(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Convert from io::Error to LinkError
impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        Self::TransportFault(err.to_string())
    }
}

/// Message-level validation failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Missing or out-of-range payload field for the given kind
    #[error("invalid {kind:?} payload: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },
}

impl ProtocolError {
    pub fn invalid(kind: MessageKind, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

/// Structural frame failure reported by the codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Bytes before the next sync marker
    #[error("no sync marker, skipped {skipped} bytes")]
    MissingSync { skipped: usize },

    /// Declared body length is zero or above the configured maximum
    #[error("bad body length {length} (max {max})")]
    BadLength { length: usize, max: usize },

    /// CRC32 mismatch
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Checksum passed but the archived message failed validation
    #[error("malformed body: {0}")]
    Malformed(String),

    /// Encoded message does not fit in a frame
    #[error("frame of {size} bytes exceeds maximum {max}")]
    Oversized { size: usize, max: usize },
}

/// Collaborator failure (sensor, actuator, display)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    #[error("sensor read failed: {0}")]
    Sensor(String),

    #[error("actuator write failed: {0}")]
    Actuator(String),

    #[error("display update failed: {0}")]
    Display(String),
}
