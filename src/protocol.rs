//! Message protocol - payload rules and sequence acceptance
//!
//! Sequences are `u16` and wrap. Acceptance compares the incoming sequence
//! with the highest one applied so far using modular distance:
//!
//! ```text
//! distance = incoming - highest (mod 65536)
//!   0 or >= 0x8000        -> DuplicateDiscard (same or behind)
//!   1..=max_forward_jump  -> Apply
//!   otherwise             -> OutOfRangeDiscard (possible desync)
//! ```
use log::warn;

use crate::config::ProtocolConfig;
use crate::contracts::{Message, MessageKind, Payload, Role};
use crate::errors::ProtocolError;

/// Half the sequence space; distances at or above it count as "behind"
const HALF_RANGE: u16 = 0x8000;

/// What to do with an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Deliver to the application and advance the inbound counter
    Apply,
    /// Already seen or older than the last applied message
    DuplicateDiscard,
    /// Forward jump too large to trust
    OutOfRangeDiscard,
}

/// Forward distance from `from` to `to` in sequence space
pub fn sequence_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Builds outbound messages and judges inbound ones for one device role
#[derive(Debug, Clone)]
pub struct MessageProtocol {
    config: ProtocolConfig,
    role: Role,
}

impl MessageProtocol {
    pub fn new(config: ProtocolConfig, role: Role) -> Self {
        Self { config, role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Build a validated outbound message
    ///
    /// # Errors
    /// `InvalidPayload` if a field required by `kind` is missing, or a value
    /// is outside its configured range.
    pub fn build(
        &self,
        kind: MessageKind,
        payload: Payload,
        sequence: u16,
        timestamp_ms: u64,
    ) -> Result<Message, ProtocolError> {
        self.validate_payload(kind, &payload)?;
        Ok(Message {
            kind,
            sequence,
            timestamp_ms,
            role: self.role,
            payload,
        })
    }

    /// Validate an inbound message; it must come from the peer role
    pub fn validate(&self, message: &Message) -> Result<(), ProtocolError> {
        if message.role != self.role.peer() {
            return Err(ProtocolError::invalid(
                message.kind,
                format!("unexpected sender role {}", message.role),
            ));
        }
        self.validate_payload(message.kind, &message.payload)
    }

    fn validate_payload(&self, kind: MessageKind, payload: &Payload) -> Result<(), ProtocolError> {
        match kind {
            MessageKind::Data => {
                let angle = payload
                    .angle
                    .ok_or_else(|| ProtocolError::invalid(kind, "angle missing"))?;
                self.check_angle(kind, angle)?;
            }
            MessageKind::Heartbeat => {
                if !payload.is_empty() {
                    return Err(ProtocolError::invalid(kind, "heartbeat carries no payload"));
                }
            }
            MessageKind::Ack => {
                if payload.ack_sequence.is_none() {
                    return Err(ProtocolError::invalid(kind, "ack sequence missing"));
                }
            }
            MessageKind::Status | MessageKind::Error => {
                let text = payload
                    .status
                    .as_deref()
                    .ok_or_else(|| ProtocolError::invalid(kind, "status text missing"))?;
                if text.len() > self.config.max_status_len {
                    return Err(ProtocolError::invalid(
                        kind,
                        format!(
                            "status text {} bytes exceeds {}",
                            text.len(),
                            self.config.max_status_len
                        ),
                    ));
                }
                // Reported angles come from the actuator, so only sanity-check them
                if let Some(angle) = payload.angle {
                    if !angle.is_finite() {
                        return Err(ProtocolError::invalid(kind, "angle is not finite"));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_angle(&self, kind: MessageKind, angle: f32) -> Result<(), ProtocolError> {
        if !angle.is_finite() || angle < self.config.angle_min || angle > self.config.angle_max {
            return Err(ProtocolError::invalid(
                kind,
                format!(
                    "angle {} outside {}..={}",
                    angle, self.config.angle_min, self.config.angle_max
                ),
            ));
        }
        Ok(())
    }

    /// Decide whether to apply an inbound message
    ///
    /// `highest_seen` is the session's highest applied inbound sequence,
    /// `None` right after a (re)connect. It is advanced only on `Apply` of an
    /// ordered kind. Heartbeats are always `Apply` and never move it.
    pub fn accept(&self, message: &Message, highest_seen: &mut Option<u16>) -> Decision {
        if !message.kind.is_ordered() {
            return Decision::Apply;
        }

        let last = match *highest_seen {
            None => {
                *highest_seen = Some(message.sequence);
                return Decision::Apply;
            }
            Some(last) => last,
        };

        let distance = sequence_distance(last, message.sequence);
        if distance == 0 || distance >= HALF_RANGE {
            Decision::DuplicateDiscard
        } else if distance > self.config.max_forward_jump {
            warn!(
                "sequence jump {} -> {} ({}) exceeds window {}, possible desync",
                last, message.sequence, distance, self.config.max_forward_jump
            );
            Decision::OutOfRangeDiscard
        } else {
            *highest_seen = Some(message.sequence);
            Decision::Apply
        }
    }
}
