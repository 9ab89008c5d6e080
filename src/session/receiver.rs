//! Receive half of a connection session
//!
//! Owns the frame accumulator and runs the periodic health check, so a
//! dedicated receive thread (or the cooperative tick) is what drives
//! reconnects and liveness.
use std::sync::Arc;

use log::{debug, warn};

use super::{Link, LinkState, SessionShared};
use crate::codec::FrameDecoder;
use crate::contracts::{Message, MessageKind};
use crate::protocol::Decision;

/// Bytes requested per transport read
const READ_CHUNK: usize = 256;

/// Reads per poll while the transport keeps filling the buffer
const MAX_READS_PER_POLL: usize = 8;

pub struct SessionReceiver {
    shared: Arc<SessionShared>,
    link: Option<Link>,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
}

impl SessionReceiver {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        let decoder = FrameDecoder::new(shared.codec);
        Self {
            shared,
            link: None,
            decoder,
            buffer: vec![0u8; READ_CHUNK],
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Whether the last poll had a transport to read from
    ///
    /// Threaded callers sleep for a poll period when this is false, since
    /// `poll` cannot block on a transport that does not exist.
    pub fn has_transport(&self) -> bool {
        self.link.is_some()
    }

    /// Run the health check, read what is available and decode it
    ///
    /// Returns messages to apply, already filtered for validity, duplicates
    /// and heartbeats, in sequence order.
    pub fn poll(&mut self) -> Vec<Message> {
        let now = self.shared.now();
        self.shared.supervise(now);

        let previous = self.link.as_ref().map(|link| link.generation);
        let link = match self.shared.current_link(&mut self.link, now) {
            Some(link) => link,
            None => {
                self.decoder.reset();
                return Vec::new();
            }
        };
        let generation = link.generation;
        if previous != Some(generation) {
            // bytes from an older connection must not prefix the new stream
            self.decoder.reset();
        }

        for _ in 0..MAX_READS_PER_POLL {
            match link.transport.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(n) => {
                    self.decoder.push(&self.buffer[..n]);
                    if n < self.buffer.len() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("read failed: {}", e);
                    self.link = None;
                    self.shared.transport_fault(generation, now, &e.to_string());
                    break;
                }
            }
        }

        self.drain(generation, now)
    }

    fn drain(&mut self, generation: u64, now: u64) -> Vec<Message> {
        let mut delivered = Vec::new();
        while let Some(frame) = self.decoder.next_frame() {
            let message = match frame {
                Ok(message) => message,
                Err(e) => {
                    self.shared.count_invalid();
                    warn!("dropping invalid frame: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.shared.protocol.validate(&message) {
                self.shared.count_rejected();
                warn!("rejecting {}: {}", message, e);
                continue;
            }

            self.shared.count_received();
            self.shared.note_inbound(generation, now);

            if message.kind == MessageKind::Heartbeat {
                continue;
            }

            match self.shared.accept_inbound(&message) {
                Decision::Apply => delivered.push(message),
                Decision::DuplicateDiscard => debug!("duplicate {} discarded", message),
                Decision::OutOfRangeDiscard => debug!("out-of-window {} discarded", message),
            }
        }
        delivered
    }
}
