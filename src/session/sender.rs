//! Send half of a connection session
//!
//! All outbound frames, including handshake and probes requested by the
//! receive half, are written from here so frames never interleave on the
//! wire.
use std::sync::Arc;

use log::{debug, info};

use super::{Link, LinkState, SessionShared};
use crate::contracts::{Message, MessageKind, Payload};
use crate::errors::{LinkError, Result};

pub struct SessionSender {
    shared: Arc<SessionShared>,
    link: Option<Link>,
    handshake: Payload,
}

impl SessionSender {
    pub(crate) fn new(shared: Arc<SessionShared>, handshake: Payload) -> Self {
        Self {
            shared,
            link: None,
            handshake,
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Payload announced in the handshake STATUS on every (re)connect
    pub fn set_handshake(&mut self, payload: Payload) {
        self.handshake = payload;
    }

    /// Send an application message
    ///
    /// DATA/STATUS/ACK/ERROR need `CONNECTED`; heartbeats are also allowed in
    /// `DEGRADED`. Returns the sequence the message was sent with.
    ///
    /// # Errors
    /// - `NotConnected` in any other state (callers drop the value)
    /// - `Protocol` if the payload is invalid; no sequence is consumed
    /// - `TransportFault` if the write failed; the session is torn down
    pub fn send(&mut self, kind: MessageKind, payload: Payload) -> Result<u16> {
        let state = self.shared.state();
        if !state.allows(kind) {
            return Err(LinkError::NotConnected(state));
        }
        let now = self.shared.now();
        let message = self.shared.protocol.build(kind, payload, 0, now)?;
        self.transmit(message, now).map(|(sequence, _)| sequence)
    }

    /// Emit pending control traffic: handshake, probe, keepalive
    pub fn service(&mut self) -> Result<()> {
        let now = self.shared.now();
        match self.shared.state() {
            // the peer's handshake may have landed first; ours is still owed
            LinkState::Connecting | LinkState::Connected if self.shared.handshake_pending() => {
                let message =
                    self.shared
                        .protocol
                        .build(MessageKind::Status, self.handshake.clone(), 0, now)?;
                let (_, generation) = self.transmit(message, now)?;
                self.shared.handshake_sent(generation);
                info!("handshake sent");
            }
            LinkState::Degraded if self.shared.take_probe() => {
                debug!("sending probe heartbeat");
                self.heartbeat(now)?;
            }
            LinkState::Connected => {
                let idle = now.saturating_sub(self.shared.last_send_ms());
                if idle >= self.shared.config.heartbeat_interval_ms {
                    debug!("keepalive after {} ms idle", idle);
                    self.heartbeat(now)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn heartbeat(&mut self, now: u64) -> Result<()> {
        let message = self
            .shared
            .protocol
            .build(MessageKind::Heartbeat, Payload::empty(), 0, now)?;
        self.transmit(message, now).map(|_| ())
    }

    /// Stamp, frame and write a validated message
    fn transmit(&mut self, mut message: Message, now: u64) -> Result<(u16, u64)> {
        let shared = &self.shared;
        let link = match shared.current_link(&mut self.link, now) {
            Some(link) => link,
            None => return Err(LinkError::NotConnected(shared.state())),
        };
        let generation = link.generation;

        message.sequence = shared.peek_sequence();
        let frame = shared.codec.encode(&message)?;

        match link.transport.write_all(&frame) {
            Ok(()) => {
                shared.commit_send(message.sequence, message.kind.is_ordered(), now);
                debug!("sent {}", message);
                Ok((message.sequence, generation))
            }
            Err(e) => {
                if e.is_transport_fault() {
                    self.link = None;
                    shared.transport_fault(generation, now, &e.to_string());
                }
                Err(e)
            }
        }
    }
}
