//! Core data structures for the SmartMotor link protocol
//!
//! All structures are archived with rkyv and validated with bytecheck on
//! receipt, so a corrupted body is rejected before any field is read.
use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// Sequence numbers wrap at this modulus (`u16` space)
pub const SEQUENCE_MODULUS: u32 = 1 << 16;

/// Message kind
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum MessageKind {
    /// Ordered application value (controller angle)
    Data,
    /// Liveness-only signal, exempt from ordering
    Heartbeat,
    /// Explicit acknowledgement of a sequence
    Ack,
    /// Device status; doubles as implicit acknowledgement when it echoes a sequence
    Status,
    /// Peer-reported failure (e.g. actuator fault)
    Error,
}

impl MessageKind {
    /// Whether this kind participates in sequence ordering
    pub fn is_ordered(&self) -> bool {
        !matches!(self, Self::Heartbeat)
    }
}

/// Role of the device that sent a message
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum Role {
    /// Reads the potentiometer and sends angles
    Controller,
    /// Drives the servo and reports what it applied
    Receiver,
}

impl Role {
    /// The role on the other end of the link
    pub fn peer(&self) -> Self {
        match self {
            Self::Controller => Self::Receiver,
            Self::Receiver => Self::Controller,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-dependent payload
///
/// Every field is optional on the wire; `MessageProtocol` decides which
/// fields a given kind requires.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[archive(check_bytes)]
pub struct Payload {
    /// Angle in degrees (DATA value, or applied angle in STATUS)
    pub angle: Option<f32>,

    /// Free-form status text
    pub status: Option<String>,

    /// Sequence being acknowledged (STATUS/ACK/ERROR replies)
    pub ack_sequence: Option<u16>,
}

impl Payload {
    /// Empty payload (HEARTBEAT)
    pub fn empty() -> Self {
        Self::default()
    }

    /// DATA payload carrying an angle
    pub fn angle(angle: f32) -> Self {
        Self {
            angle: Some(angle),
            ..Self::default()
        }
    }

    /// Status text only
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            status: Some(text.into()),
            ..Self::default()
        }
    }

    /// Attach an applied/current angle
    pub fn with_angle(mut self, angle: f32) -> Self {
        self.angle = Some(angle);
        self
    }

    /// Attach the sequence being acknowledged
    pub fn acknowledging(mut self, sequence: u16) -> Self {
        self.ack_sequence = Some(sequence);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.angle.is_none() && self.status.is_none() && self.ack_sequence.is_none()
    }
}

/// Message - unit of communication between controller and receiver
///
/// # Fields
/// - `kind`: what the message means
/// - `sequence`: per-sender counter, strictly increasing modulo `SEQUENCE_MODULUS`
/// - `timestamp_ms`: sender-local monotonic time at send; never compared across devices
/// - `role`: sending device role
/// - `payload`: kind-dependent record
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Message {
    pub kind: MessageKind,
    pub sequence: u16,
    pub timestamp_ms: u64,
    pub role: Role,
    pub payload: Payload,
}

impl Message {
    /// Acknowledged sequence, if this message echoes one
    pub fn acknowledged(&self) -> Option<u16> {
        match self.kind {
            MessageKind::Status | MessageKind::Ack | MessageKind::Error => {
                self.payload.ack_sequence
            }
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{} from {}", self.kind, self.sequence, self.role)?;
        if let Some(angle) = self.payload.angle {
            write!(f, " angle={:.1}", angle)?;
        }
        if let Some(ack) = self.payload.ack_sequence {
            write!(f, " ack={}", ack)?;
        }
        if let Some(status) = &self.payload.status {
            write!(f, " status={:?}", status)?;
        }
        Ok(())
    }
}
