//! Connection session - one long-lived logical link to the single peer
//!
//! # State Machine
//! ```text
//!  DISCONNECTED --backoff elapsed--> CONNECTING --peer frame--> CONNECTED
//!        ^                               |                        |   ^
//!        |        connect/handshake fail |              silence   |   | any frame
//!        +-------------------------------+                        v   |
//!        |                                                      DEGRADED
//!        +------------- RECOVERING <------- probe unanswered -------+
//!
//!  CONNECTING --failures >= max--> FATAL (terminal)
//!  any linked state --transport fault--> DISCONNECTED
//! ```
//!
//! # Concurrency
//! The session is split into a [`SessionSender`] and a [`SessionReceiver`].
//! Steady-state traffic touches disjoint atomics (outbound sequence and send
//! time on one side, inbound sequence and receive time on the other) and
//! never locks. Every transition that changes the state or resets counters
//! runs under the single lifecycle mutex, which either half may take.
//!
//! Each half keeps its own clone of the transport tagged with the
//! generation it was cloned at. Teardown bumps the generation, so a half
//! still holding an old clone drops it instead of writing into a new link.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::backoff::ReconnectPolicy;
use crate::clock::SharedClock;
use crate::codec::FrameCodec;
use crate::config::{LinkConfig, ProtocolConfig, SessionConfig};
use crate::contracts::{Message, MessageKind, Payload, Role};
use crate::errors::Result;
use crate::protocol::{Decision, MessageProtocol};
use crate::transport::{Connector, Transport};
use crate::LINK_VERSION;

mod receiver;
mod sender;

pub use receiver::SessionReceiver;
pub use sender::SessionSender;

/// Sentinel for "no inbound sequence applied since connect"
const NO_INBOUND: u32 = u32::MAX;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
    Recovering = 4,
    /// Reconnect ceiling reached; no further automatic attempts
    Fatal = 5,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            4 => Self::Recovering,
            5 => Self::Fatal,
            _ => Self::Disconnected,
        }
    }

    /// Whether a message of `kind` may be sent by the application
    pub fn allows(&self, kind: MessageKind) -> bool {
        match self {
            Self::Connected => true,
            Self::Degraded => kind == MessageKind::Heartbeat,
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Degraded => "DEGRADED",
            Self::Recovering => "RECOVERING",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Traffic counters, monotonically increasing for the session lifetime
#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    invalid_frames: AtomicU64,
    rejected_messages: AtomicU64,
    duplicates: AtomicU64,
    out_of_range: AtomicU64,
    connects: AtomicU64,
    teardowns: AtomicU64,
}

/// Plain copy of the traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub invalid_frames: u64,
    pub rejected_messages: u64,
    pub duplicates: u64,
    pub out_of_range: u64,
    pub connects: u64,
    pub teardowns: u64,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: LinkState,
    pub generation: u64,
    /// Sequence the next outbound message will carry
    pub outbound_sequence: u16,
    pub highest_inbound_sequence: Option<u16>,
    pub last_send_ms: u64,
    pub last_receive_ms: u64,
    pub consecutive_failures: u32,
    pub next_attempt_ms: u64,
    pub fatal_reason: Option<String>,
    pub stats: LinkStats,
}

/// Fields only touched under the lifecycle lock
struct Lifecycle {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    consecutive_failures: u32,
    next_attempt_ms: u64,
    phase_started_ms: u64,
    fatal_reason: Option<String>,
}

/// Transport clone held by one half, tagged with its generation
pub(crate) struct Link {
    pub(crate) generation: u64,
    pub(crate) transport: Box<dyn Transport>,
}

/// State shared by both halves
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) protocol: MessageProtocol,
    pub(crate) codec: FrameCodec,
    pub(crate) clock: SharedClock,
    policy: ReconnectPolicy,

    // written only under the lifecycle lock, read anywhere
    state: AtomicU8,
    generation: AtomicU64,

    // send side
    outbound_sequence: AtomicU16,
    last_send_ms: AtomicU64,

    // receive side
    highest_inbound: AtomicU32,
    last_receive_ms: AtomicU64,

    // control traffic requested from the send side
    handshake_pending: AtomicBool,
    probe_pending: AtomicBool,

    shutdown: AtomicBool,
    counters: Counters,
    lifecycle: Mutex<Lifecycle>,
}

impl SessionShared {
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn transition(&self, to: LinkState) {
        let from = self.state();
        if from != to {
            info!("link {} -> {}", from, to);
            self.state.store(to as u8, Ordering::SeqCst);
        }
    }

    fn reset_counters(&self, now: u64) {
        self.outbound_sequence.store(0, Ordering::SeqCst);
        self.highest_inbound.store(NO_INBOUND, Ordering::SeqCst);
        self.last_send_ms.store(now, Ordering::SeqCst);
        self.last_receive_ms.store(now, Ordering::SeqCst);
        self.handshake_pending.store(false, Ordering::SeqCst);
        self.probe_pending.store(false, Ordering::SeqCst);
    }

    // ---- send side -------------------------------------------------------

    pub(crate) fn peek_sequence(&self) -> u16 {
        self.outbound_sequence.load(Ordering::SeqCst)
    }

    /// Record a successful write; ordered kinds advance past `sequence`
    ///
    /// Heartbeats reuse the current sequence, since the receiver never
    /// orders them. Loses against a concurrent reset, which is the intended
    /// outcome.
    pub(crate) fn commit_send(&self, sequence: u16, ordered: bool, now: u64) {
        if ordered {
            let _ = self.outbound_sequence.compare_exchange(
                sequence,
                sequence.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.last_send_ms.store(now, Ordering::SeqCst);
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn last_send_ms(&self) -> u64 {
        self.last_send_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn handshake_pending(&self) -> bool {
        self.handshake_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn handshake_sent(&self, generation: u64) {
        if generation == self.generation() {
            self.handshake_pending.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn take_probe(&self) -> bool {
        self.probe_pending.swap(false, Ordering::SeqCst)
    }

    // ---- receive side ----------------------------------------------------

    /// Run the sequence decision against the shared inbound counter
    pub(crate) fn accept_inbound(&self, message: &Message) -> Decision {
        let stored = self.highest_inbound.load(Ordering::SeqCst);
        let mut highest = if stored == NO_INBOUND {
            None
        } else {
            Some(stored as u16)
        };

        let decision = self.protocol.accept(message, &mut highest);
        match decision {
            Decision::Apply => {
                if let Some(sequence) = highest {
                    // A failed exchange means a reset raced us; keep the reset
                    let _ = self.highest_inbound.compare_exchange(
                        stored,
                        sequence as u32,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
            Decision::DuplicateDiscard => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Decision::OutOfRangeDiscard => {
                self.counters.out_of_range.fetch_add(1, Ordering::Relaxed);
            }
        }
        decision
    }

    pub(crate) fn count_received(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_invalid(&self) {
        self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_rejected(&self) {
        self.counters.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Any valid frame from the peer proves liveness
    pub(crate) fn note_inbound(&self, generation: u64, now: u64) {
        self.last_receive_ms.store(now, Ordering::SeqCst);
        if !matches!(self.state(), LinkState::Connecting | LinkState::Degraded) {
            return;
        }

        let mut life = self.lifecycle.lock();
        if generation != self.generation() {
            return;
        }
        match self.state() {
            LinkState::Connecting => {
                life.consecutive_failures = 0;
                self.counters.connects.fetch_add(1, Ordering::Relaxed);
                self.transition(LinkState::Connected);
            }
            LinkState::Degraded => {
                self.probe_pending.store(false, Ordering::SeqCst);
                self.transition(LinkState::Connected);
            }
            _ => {}
        }
    }

    // ---- links -----------------------------------------------------------

    /// Current transport clone for one half, refreshed on generation change
    pub(crate) fn current_link<'a>(
        &self,
        link: &'a mut Option<Link>,
        now: u64,
    ) -> Option<&'a mut Link> {
        let fresh = link
            .as_ref()
            .map_or(false, |held| held.generation == self.generation());
        if !fresh {
            *link = self.clone_link(now);
        }
        link.as_mut()
    }

    fn clone_link(&self, now: u64) -> Option<Link> {
        let mut life = self.lifecycle.lock();
        let generation = self.generation();
        let cloned = life.transport.as_ref().map(|transport| transport.try_clone())?;
        match cloned {
            Ok(transport) => Some(Link {
                generation,
                transport,
            }),
            Err(e) => {
                self.fault_locked(&mut life, generation, now, &e.to_string());
                None
            }
        }
    }

    // ---- transitions -----------------------------------------------------

    /// Periodic health check; drives connects, liveness and recovery
    pub(crate) fn supervise(&self, now: u64) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match self.state() {
            LinkState::Fatal => return,
            LinkState::Connected => {
                let silent = now.saturating_sub(self.last_receive_ms.load(Ordering::SeqCst));
                if silent < self.config.liveness_timeout_ms {
                    return;
                }
            }
            _ => {}
        }

        let mut life = self.lifecycle.lock();
        match self.state() {
            LinkState::Disconnected => {
                if now >= life.next_attempt_ms {
                    info!(
                        "connecting (attempt {} of {})",
                        life.consecutive_failures + 1,
                        self.policy.max_attempts
                    );
                    life.phase_started_ms = now;
                    self.transition(LinkState::Connecting);
                    self.drive_connect(&mut life, now);
                }
            }
            LinkState::Connecting => self.drive_connect(&mut life, now),
            LinkState::Connected => {
                let silent = now.saturating_sub(self.last_receive_ms.load(Ordering::SeqCst));
                if silent >= self.config.liveness_timeout_ms {
                    warn!("no traffic from peer for {} ms, probing", silent);
                    life.phase_started_ms = now;
                    self.probe_pending.store(true, Ordering::SeqCst);
                    self.transition(LinkState::Degraded);
                }
            }
            LinkState::Degraded => {
                if now.saturating_sub(life.phase_started_ms) >= self.config.probe_timeout_ms {
                    warn!("probe unanswered after {} ms", self.config.probe_timeout_ms);
                    self.transition(LinkState::Recovering);
                    self.teardown(&mut life, now, "probe unanswered");
                }
            }
            LinkState::Recovering => self.teardown(&mut life, now, "recovery"),
            LinkState::Fatal => {}
        }
    }

    fn drive_connect(&self, life: &mut Lifecycle, now: u64) {
        let elapsed = now.saturating_sub(life.phase_started_ms);

        if life.transport.is_some() {
            // established, waiting for the peer's first frame
            if elapsed < self.config.connect_timeout_ms {
                return;
            }
            if life.connector.is_rendezvous() {
                // our handshake is queued at the relay until the peer joins
                debug!("relay up, peer still absent after {} ms", elapsed);
                life.phase_started_ms = now;
            } else {
                self.connect_failed(life, now, "handshake timed out");
            }
            return;
        }

        match life.connector.poll_connect() {
            Ok(Some(transport)) => {
                info!("transport up to {}", transport.peer());
                life.transport = Some(transport);
                life.phase_started_ms = now;
                self.reset_counters(now);
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.handshake_pending.store(true, Ordering::SeqCst);
            }
            Ok(None) => {
                if elapsed < self.config.connect_timeout_ms {
                    return;
                }
                if life.connector.is_passive() {
                    debug!("still waiting for peer after {} ms", elapsed);
                    life.phase_started_ms = now;
                } else {
                    life.connector.abort();
                    self.connect_failed(life, now, "connect timed out");
                }
            }
            Err(e) => self.connect_failed(life, now, &e.to_string()),
        }
    }

    fn connect_failed(&self, life: &mut Lifecycle, now: u64, reason: &str) {
        if let Some(mut transport) = life.transport.take() {
            transport.close();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.reset_counters(now);
        life.consecutive_failures += 1;

        if self.policy.is_exhausted(life.consecutive_failures) {
            let message = format!(
                "{} consecutive connect failures, last: {}",
                life.consecutive_failures, reason
            );
            error!("giving up: {}", message);
            life.fatal_reason = Some(message);
            self.transition(LinkState::Fatal);
            return;
        }

        let delay = self.policy.delay_ms(life.consecutive_failures);
        warn!(
            "connect attempt {} failed: {} (retry in {} ms)",
            life.consecutive_failures, reason, delay
        );
        life.next_attempt_ms = now + delay;
        self.transition(LinkState::Disconnected);
    }

    fn teardown(&self, life: &mut Lifecycle, now: u64, reason: &str) {
        if let Some(mut transport) = life.transport.take() {
            transport.close();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reset_counters(now);
        self.counters.teardowns.fetch_add(1, Ordering::Relaxed);

        let delay = self.policy.delay_ms(life.consecutive_failures);
        warn!("link down: {} (reconnect in {} ms)", reason, delay);
        life.next_attempt_ms = now + delay;
        self.transition(LinkState::Disconnected);
    }

    /// Hard read/write failure observed by either half
    pub(crate) fn transport_fault(&self, generation: u64, now: u64, reason: &str) {
        let mut life = self.lifecycle.lock();
        self.fault_locked(&mut life, generation, now, reason);
    }

    fn fault_locked(&self, life: &mut Lifecycle, generation: u64, now: u64, reason: &str) {
        if generation != self.generation() || self.shutdown.load(Ordering::SeqCst) {
            debug!("ignoring fault from stale link: {}", reason);
            return;
        }
        match self.state() {
            LinkState::Connecting => self.connect_failed(life, now, reason),
            LinkState::Connected | LinkState::Degraded | LinkState::Recovering => {
                self.teardown(life, now, reason)
            }
            LinkState::Disconnected | LinkState::Fatal => {}
        }
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut life = self.lifecycle.lock();
        if let Some(mut transport) = life.transport.take() {
            transport.close();
        }
        life.connector.abort();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.state() != LinkState::Fatal {
            self.transition(LinkState::Disconnected);
        }
        info!("session shut down");
    }

    fn snapshot(&self) -> SessionSnapshot {
        let life = self.lifecycle.lock();
        let highest = self.highest_inbound.load(Ordering::SeqCst);
        let c = &self.counters;
        SessionSnapshot {
            state: self.state(),
            generation: self.generation(),
            outbound_sequence: self.peek_sequence(),
            highest_inbound_sequence: (highest != NO_INBOUND).then_some(highest as u16),
            last_send_ms: self.last_send_ms(),
            last_receive_ms: self.last_receive_ms.load(Ordering::SeqCst),
            consecutive_failures: life.consecutive_failures,
            next_attempt_ms: life.next_attempt_ms,
            fatal_reason: life.fatal_reason.clone(),
            stats: LinkStats {
                frames_sent: c.frames_sent.load(Ordering::Relaxed),
                frames_received: c.frames_received.load(Ordering::Relaxed),
                invalid_frames: c.invalid_frames.load(Ordering::Relaxed),
                rejected_messages: c.rejected_messages.load(Ordering::Relaxed),
                duplicates: c.duplicates.load(Ordering::Relaxed),
                out_of_range: c.out_of_range.load(Ordering::Relaxed),
                connects: c.connects.load(Ordering::Relaxed),
                teardowns: c.teardowns.load(Ordering::Relaxed),
            },
        }
    }
}

/// Cheap, clonable view of a session for monitoring and shutdown
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Close the transport and stop all further connect attempts
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

/// Both halves of a session, for the cooperative scheduling model
pub struct ConnectionSession {
    sender: SessionSender,
    receiver: SessionReceiver,
}

impl ConnectionSession {
    pub fn new(
        session: SessionConfig,
        protocol: ProtocolConfig,
        role: Role,
        connector: Box<dyn Connector>,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now_ms();
        let codec = FrameCodec::new(protocol.max_frame_size);
        let shared = Arc::new(SessionShared {
            policy: ReconnectPolicy::from_config(&session),
            config: session,
            protocol: MessageProtocol::new(protocol, role),
            codec,
            clock,
            state: AtomicU8::new(LinkState::Disconnected as u8),
            generation: AtomicU64::new(0),
            outbound_sequence: AtomicU16::new(0),
            last_send_ms: AtomicU64::new(now),
            highest_inbound: AtomicU32::new(NO_INBOUND),
            last_receive_ms: AtomicU64::new(now),
            handshake_pending: AtomicBool::new(false),
            probe_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
            lifecycle: Mutex::new(Lifecycle {
                connector,
                transport: None,
                consecutive_failures: 0,
                next_attempt_ms: now,
                phase_started_ms: now,
                fatal_reason: None,
            }),
        });

        let handshake = Payload::status(format!("{} ready v{}", role, LINK_VERSION));
        Self {
            sender: SessionSender::new(shared.clone(), handshake),
            receiver: SessionReceiver::new(shared),
        }
    }

    pub fn from_config(
        config: &LinkConfig,
        role: Role,
        connector: Box<dyn Connector>,
        clock: SharedClock,
    ) -> Self {
        Self::new(
            config.session.clone(),
            config.protocol.clone(),
            role,
            connector,
            clock,
        )
    }

    /// One cooperative step: health check and receive, then control traffic
    ///
    /// Returns the inbound messages to apply, in sequence order.
    pub fn tick(&mut self) -> Vec<Message> {
        let delivered = self.receiver.poll();
        if let Err(e) = self.sender.service() {
            debug!("control traffic skipped: {}", e);
        }
        delivered
    }

    /// Send an application message; see [`SessionSender::send`]
    pub fn send(&mut self, kind: MessageKind, payload: Payload) -> Result<u16> {
        self.sender.send(kind, payload)
    }

    /// Payload announced in the handshake STATUS on every (re)connect
    pub fn set_handshake(&mut self, payload: Payload) {
        self.sender.set_handshake(payload);
    }

    pub fn state(&self) -> LinkState {
        self.receiver.shared().state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.receiver.shared().snapshot()
    }

    pub fn role(&self) -> Role {
        self.receiver.shared().protocol.role()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.receiver.shared().config
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.receiver.shared().clone(),
        }
    }

    pub fn shutdown(&self) {
        self.receiver.shared().shutdown();
    }

    /// Separate halves for the threaded scheduling model
    pub fn split(self) -> (SessionSender, SessionReceiver) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::FrameDecoder;
    use crate::errors::LinkError;
    use crate::transport::mock::{ConnectStep, MockConnector, MockTransport};

    /// The far end of a mock link, speaking as the receiver role
    struct Peer {
        endpoint: MockTransport,
        protocol: MessageProtocol,
        codec: FrameCodec,
        decoder: FrameDecoder,
        sequence: u16,
    }

    impl Peer {
        fn new(endpoint: MockTransport) -> Self {
            let codec = FrameCodec::new(ProtocolConfig::default().max_frame_size);
            Self {
                endpoint,
                protocol: MessageProtocol::new(ProtocolConfig::default(), Role::Receiver),
                codec,
                decoder: FrameDecoder::new(codec),
                sequence: 0,
            }
        }

        fn send(&mut self, kind: MessageKind, payload: Payload) {
            let message = self.protocol.build(kind, payload, self.sequence, 0).unwrap();
            if kind.is_ordered() {
                self.sequence = self.sequence.wrapping_add(1);
            }
            self.send_raw(&message);
        }

        fn send_raw(&mut self, message: &Message) {
            let frame = self.codec.encode(message).unwrap();
            self.endpoint.write_all(&frame).unwrap();
        }

        fn received(&mut self) -> Vec<Message> {
            let mut buf = [0u8; 512];
            loop {
                match self.endpoint.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => self.decoder.push(&buf[..n]),
                }
            }
            let mut out = Vec::new();
            while let Some(frame) = self.decoder.next_frame() {
                out.push(frame.unwrap());
            }
            out
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            connect_timeout_ms: 1_000,
            liveness_timeout_ms: 3_000,
            probe_timeout_ms: 2_000,
            heartbeat_interval_ms: 1_000,
            max_reconnect_attempts: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 400,
            ..SessionConfig::default()
        }
    }

    fn session(connector: MockConnector, clock: &ManualClock) -> ConnectionSession {
        ConnectionSession::new(
            config(),
            ProtocolConfig::default(),
            Role::Controller,
            Box::new(connector),
            clock.shared(),
        )
    }

    /// Session connected to a peer that has completed the handshake
    fn connected(clock: &ManualClock) -> (ConnectionSession, Peer, MockTransport) {
        let (local, remote) = MockTransport::pair();
        let mut session = session(MockConnector::ready(local.clone()), clock);
        let mut peer = Peer::new(remote);

        session.tick();
        assert_eq!(session.state(), LinkState::Connecting);
        let handshake = peer.received();
        assert_eq!(handshake.len(), 1);
        assert_eq!(handshake[0].kind, MessageKind::Status);
        assert_eq!(handshake[0].sequence, 0);

        peer.send(MessageKind::Status, Payload::status("receiver ready v1").with_angle(90.0));
        let delivered = session.tick();
        assert_eq!(session.state(), LinkState::Connected);
        assert_eq!(delivered.len(), 1);
        (session, peer, local)
    }

    #[test]
    fn test_handshake_connects_and_first_data_is_seq_one() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);

        let seq = session.send(MessageKind::Data, Payload::angle(90.0)).unwrap();
        assert_eq!(seq, 1);
        let frames = peer.received();
        assert_eq!(frames[0].kind, MessageKind::Data);
        assert_eq!(frames[0].payload.angle, Some(90.0));
        assert_eq!(session.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_send_rejected_when_not_connected() {
        let clock = ManualClock::new(0);
        let connector = MockConnector::new();
        connector.push(ConnectStep::Stall);
        let mut session = session(connector, &clock);

        let err = session.send(MessageKind::Data, Payload::angle(10.0)).unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(LinkState::Disconnected)));

        session.tick();
        let err = session.send(MessageKind::Data, Payload::angle(10.0)).unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(LinkState::Connecting)));
    }

    #[test]
    fn test_invalid_payload_does_not_consume_sequence() {
        let clock = ManualClock::new(0);
        let (mut session, _peer, _) = connected(&clock);
        assert!(session.send(MessageKind::Data, Payload::angle(500.0)).is_err());
        assert_eq!(session.send(MessageKind::Data, Payload::angle(5.0)).unwrap(), 1);
    }

    #[test]
    fn test_backoff_then_fatal_after_max_attempts() {
        let clock = ManualClock::new(0);
        let connector = MockConnector::new();
        let mut session = session(connector.clone(), &clock);

        session.tick();
        let snap = session.snapshot();
        assert_eq!(snap.state, LinkState::Disconnected);
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.next_attempt_ms, 100);

        // not yet due
        clock.advance(50);
        session.tick();
        assert_eq!(connector.polls(), 1);

        clock.advance(50);
        session.tick();
        assert_eq!(connector.polls(), 2);
        assert_eq!(session.snapshot().next_attempt_ms, 300);

        clock.advance(200);
        session.tick();
        assert_eq!(session.state(), LinkState::Fatal);
        assert!(session.snapshot().fatal_reason.is_some());

        for _ in 0..20 {
            clock.advance(10_000);
            session.tick();
        }
        assert_eq!(connector.polls(), 3);
        assert_eq!(session.state(), LinkState::Fatal);
    }

    #[test]
    fn test_connect_timeout_aborts_and_counts() {
        let clock = ManualClock::new(0);
        let connector = MockConnector::new();
        connector.push(ConnectStep::Stall);
        let mut session = session(connector.clone(), &clock);

        session.tick();
        assert_eq!(session.state(), LinkState::Connecting);
        clock.advance(999);
        session.tick();
        assert_eq!(session.state(), LinkState::Connecting);
        clock.advance(1);
        session.tick();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(connector.aborts(), 1);
        assert_eq!(session.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_passive_connector_waits_without_failing() {
        let clock = ManualClock::new(0);
        let connector = MockConnector::new().passive();
        connector.push(ConnectStep::Stall);
        let mut session = session(connector, &clock);

        for _ in 0..10 {
            clock.advance(1_000);
            session.tick();
        }
        assert_eq!(session.state(), LinkState::Connecting);
        assert_eq!(session.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_handshake_timeout_counts_as_failure() {
        let clock = ManualClock::new(0);
        let (local, _remote) = MockTransport::pair();
        let mut session = session(MockConnector::ready(local.clone()), &clock);

        session.tick();
        assert_eq!(session.state(), LinkState::Connecting);
        clock.advance(1_000);
        session.tick();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(session.snapshot().consecutive_failures, 1);
        assert!(local.is_closed());
    }

    #[test]
    fn test_silence_degrades_and_heartbeat_recovers() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);

        clock.advance(3_000);
        session.tick();
        assert_eq!(session.state(), LinkState::Degraded);
        let probe = peer.received();
        assert_eq!(probe.last().map(|m| m.kind), Some(MessageKind::Heartbeat));

        // only heartbeats may go out while degraded
        let err = session.send(MessageKind::Data, Payload::angle(1.0)).unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(LinkState::Degraded)));
        assert!(session.send(MessageKind::Heartbeat, Payload::empty()).is_ok());

        peer.send(MessageKind::Heartbeat, Payload::empty());
        let delivered = session.tick();
        assert!(delivered.is_empty());
        assert_eq!(session.state(), LinkState::Connected);
    }

    #[test]
    fn test_unanswered_probe_recovers_and_resets_counters() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, local) = connected(&clock);
        session.send(MessageKind::Data, Payload::angle(20.0)).unwrap();
        peer.send(MessageKind::Status, Payload::status("ok").acknowledging(1));
        session.tick();
        let before = session.snapshot();
        assert_eq!(before.highest_inbound_sequence, Some(1));

        clock.advance(3_000);
        session.tick();
        assert_eq!(session.state(), LinkState::Degraded);
        clock.advance(2_000);
        session.tick();

        let after = session.snapshot();
        assert_eq!(after.state, LinkState::Disconnected);
        assert_eq!(after.outbound_sequence, 0);
        assert_eq!(after.highest_inbound_sequence, None);
        assert!(after.generation > before.generation);
        assert_eq!(after.stats.teardowns, 1);
        assert!(local.is_closed());
    }

    #[test]
    fn test_keepalive_heartbeat_when_idle() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);

        clock.advance(500);
        session.tick();
        assert!(peer.received().is_empty());

        clock.advance(500);
        session.tick();
        let frames = peer.received();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageKind::Heartbeat);
    }

    #[test]
    fn test_heartbeats_leave_sequence_untouched() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);

        for _ in 0..5 {
            clock.advance(1_000);
            peer.send(MessageKind::Heartbeat, Payload::empty());
            session.tick();
        }
        let heartbeats = peer.received();
        assert_eq!(heartbeats.len(), 5);
        assert!(heartbeats.iter().all(|m| m.sequence == 1));
        assert_eq!(session.snapshot().outbound_sequence, 1);

        assert_eq!(session.send(MessageKind::Data, Payload::angle(12.0)).unwrap(), 1);
    }

    #[test]
    fn test_relay_waits_for_late_peer_without_failing() {
        let clock = ManualClock::new(0);
        let (local, remote) = MockTransport::pair();
        let connector = MockConnector::ready(local.clone()).rendezvous();
        let mut session = session(connector.clone(), &clock);

        session.tick();
        for _ in 0..10 {
            clock.advance(1_000);
            session.tick();
        }
        let snap = session.snapshot();
        assert_eq!(snap.state, LinkState::Connecting);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(connector.polls(), 1);
        assert!(!local.is_closed());

        let mut peer = Peer::new(remote);
        let handshake = peer.received();
        assert_eq!(handshake.len(), 1);
        peer.send(MessageKind::Status, Payload::status("receiver ready v1"));
        session.tick();
        assert_eq!(session.state(), LinkState::Connected);
    }

    #[test]
    fn test_write_fault_disconnects() {
        let clock = ManualClock::new(0);
        let (mut session, _peer, local) = connected(&clock);
        local.set_fail_writes(true);

        let err = session.send(MessageKind::Data, Payload::angle(45.0)).unwrap_err();
        assert!(err.is_transport_fault());
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_peer_close_disconnects() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);
        peer.endpoint.close();
        session.tick();
        assert_eq!(session.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_duplicates_and_garbage_absorbed() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);

        let status = peer
            .protocol
            .build(MessageKind::Status, Payload::status("ok").acknowledging(1), 1, 0)
            .unwrap();
        peer.send_raw(&status);
        peer.endpoint.write_all(&[0x00, 0xFF, 0x13]).unwrap();
        peer.send_raw(&status);

        let delivered = session.tick();
        assert_eq!(delivered, vec![status]);
        let stats = session.snapshot().stats;
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.invalid_frames, 1);
        assert_eq!(session.state(), LinkState::Connected);
    }

    #[test]
    fn test_message_from_wrong_role_rejected() {
        let clock = ManualClock::new(0);
        let (mut session, mut peer, _) = connected(&clock);
        let impostor = MessageProtocol::new(ProtocolConfig::default(), Role::Controller)
            .build(MessageKind::Data, Payload::angle(10.0), 1, 0)
            .unwrap();
        peer.send_raw(&impostor);
        assert!(session.tick().is_empty());
        assert_eq!(session.snapshot().stats.rejected_messages, 1);
    }

    #[test]
    fn test_reconnect_after_teardown() {
        let clock = ManualClock::new(0);
        let (first, remote) = MockTransport::pair();
        let (second, remote2) = MockTransport::pair();
        let connector = MockConnector::ready(first);
        connector.push(ConnectStep::Ready(second));
        let mut session = session(connector, &clock);

        let mut peer = Peer::new(remote);
        session.tick();
        peer.send(MessageKind::Status, Payload::status("hi"));
        session.tick();
        assert_eq!(session.state(), LinkState::Connected);

        peer.endpoint.close();
        session.tick();
        assert_eq!(session.state(), LinkState::Disconnected);

        clock.advance(100);
        session.tick();
        let mut peer2 = Peer::new(remote2);
        let handshake = peer2.received();
        assert_eq!(handshake[0].sequence, 0);
        peer2.send(MessageKind::Status, Payload::status("hi again"));
        session.tick();
        assert_eq!(session.state(), LinkState::Connected);
        assert_eq!(session.snapshot().stats.connects, 2);
    }

    #[test]
    fn test_shutdown_closes_and_stops() {
        let clock = ManualClock::new(0);
        let (session, _peer, local) = {
            let (mut s, p, l) = connected(&clock);
            s.tick();
            (s, p, l)
        };
        let handle = session.handle();
        handle.shutdown();
        assert_eq!(session.state(), LinkState::Disconnected);
        assert!(local.is_closed());
        assert!(handle.is_shut_down());
    }
}
