//! Receiver role - applies angles to the servo and reports back
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};

use super::{fatal_check, show_status, should_stop, stop_and_join, MessageSink, RoleTick, CHANNEL_CAPACITY};
use crate::config::ReceiverConfig;
use crate::contracts::{Message, MessageKind, Payload, Role};
use crate::errors::{LinkError, Result};
use crate::hardware::{Actuator, DisplayStatus, StatusDisplay};
use crate::session::{ConnectionSession, LinkState};

/// Longest fault description put on the wire
const FAULT_TEXT_LEN: usize = 32;

/// Reply the receiver owes the controller
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: MessageKind,
    pub payload: Payload,
}

/// Handshake payload announcing the current servo position
pub fn handshake_payload(angle: Option<f32>) -> Payload {
    let payload = Payload::status("ready");
    match angle {
        Some(angle) => payload.with_angle(angle),
        None => payload,
    }
}

pub struct Receiver<A: Actuator, D: StatusDisplay> {
    actuator: A,
    display: D,
    config: ReceiverConfig,
    announced: Option<f32>,
    last_applied: Option<u16>,
    applied: u64,
    faults: u64,
}

impl<A: Actuator, D: StatusDisplay> Receiver<A, D> {
    /// Create the role and drive the servo to its center position
    pub fn new(actuator: A, display: D, config: ReceiverConfig) -> Self {
        let mut receiver = Self {
            actuator,
            display,
            config,
            announced: None,
            last_applied: None,
            applied: 0,
            faults: 0,
        };
        let center = receiver.config.center_angle;
        if let Err(e) = receiver.actuator.write(center) {
            warn!("could not center servo: {}", e);
        }
        receiver
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Apply one inbound message; returns the reply to send, if any
    pub fn handle_inbound(&mut self, message: &Message) -> Option<Reply> {
        match message.kind {
            MessageKind::Data => {
                let requested = message.payload.angle?;
                let angle = self.config.clamp(requested);
                if angle != requested {
                    debug!("clamped {:.1} to {:.1}", requested, angle);
                }
                match self.actuator.write(angle) {
                    Ok(()) => {
                        self.applied += 1;
                        self.last_applied = Some(message.sequence);
                        debug!("applied #{} -> {:.1}", message.sequence, angle);
                        Some(Reply {
                            kind: MessageKind::Status,
                            payload: Payload::status("ok")
                                .with_angle(angle)
                                .acknowledging(message.sequence),
                        })
                    }
                    Err(e) => {
                        self.faults += 1;
                        warn!("actuator fault on #{}: {}", message.sequence, e);
                        let text: String = e.to_string().chars().take(FAULT_TEXT_LEN).collect();
                        Some(Reply {
                            kind: MessageKind::Error,
                            payload: Payload::status(text).acknowledging(message.sequence),
                        })
                    }
                }
            }
            MessageKind::Status => {
                info!("controller status: {}", message);
                None
            }
            _ => {
                debug!("ignoring {}", message);
                None
            }
        }
    }

    fn reply<M: MessageSink>(sink: &mut M, reply: Reply) {
        match sink.send(reply.kind, reply.payload) {
            Ok(_) => {}
            Err(LinkError::NotConnected(state)) => debug!("reply dropped: link {}", state),
            Err(e) => warn!("reply failed: {}", e),
        }
    }

    fn refresh_display(&mut self, state: LinkState) {
        let status = DisplayStatus {
            role: Role::Receiver,
            state,
            sequence: self.last_applied,
            value: self.actuator.position(),
            rtt_ms: None,
        };
        show_status(&mut self.display, &status);
    }

    /// Threaded model: `link-rx` applies values, this thread sends replies
    pub fn run_threaded(self, session: ConnectionSession, shutdown: Arc<AtomicBool>) -> Result<()>
    where
        A: 'static,
        D: 'static,
    {
        let handle = session.handle();
        let poll = session.config().poll_timeout();
        // bounded wait so keepalives and handshakes go out on time
        let wait = Duration::from_millis(session.config().heartbeat_interval_ms / 4)
            .max(Duration::from_millis(1));
        let (mut sender, mut receiver) = session.split();
        sender.set_handshake(handshake_payload(self.actuator.position()));
        let (tx, rx) = bounded::<Reply>(CHANNEL_CAPACITY);

        let rx_shutdown = shutdown.clone();
        let rx_handle = handle.clone();
        let mut role = self;
        let worker = thread::Builder::new()
            .name("link-rx".to_string())
            .spawn(move || {
                while !should_stop(&rx_shutdown, &rx_handle) {
                    for message in receiver.poll() {
                        if let Some(reply) = role.handle_inbound(&message) {
                            if tx.try_send(reply).is_err() {
                                warn!("reply queue full, dropping reply");
                            }
                        }
                    }
                    role.refresh_display(rx_handle.state());
                    if !receiver.has_transport() {
                        thread::sleep(poll);
                    }
                }
                role.refresh_display(rx_handle.state());
                debug!("receive thread exiting");
            })
            .map_err(|e| LinkError::Runtime(format!("failed to spawn receive thread: {}", e)))?;

        info!("receiver running threaded");
        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(e) = fatal_check(&handle) {
                break Err(e);
            }
            if let Err(e) = sender.service() {
                debug!("control traffic skipped: {}", e);
            }
            match rx.recv_timeout(wait) {
                Ok(reply) => {
                    if reply.kind == MessageKind::Status {
                        sender.set_handshake(handshake_payload(reply.payload.angle));
                    }
                    Self::reply(&mut sender, reply);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break fatal_check(&handle),
            }
        };

        stop_and_join(&handle, worker);
        result
    }
}

impl<A: Actuator, D: StatusDisplay> RoleTick for Receiver<A, D> {
    fn tick(&mut self, session: &mut ConnectionSession) -> Result<()> {
        let position = self.actuator.position();
        if self.announced != position {
            session.set_handshake(handshake_payload(position));
            self.announced = position;
        }

        for message in session.tick() {
            if let Some(reply) = self.handle_inbound(&message) {
                Self::reply(session, reply);
            }
        }
        fatal_check(&session.handle())?;
        self.refresh_display(session.state());
        Ok(())
    }
}
