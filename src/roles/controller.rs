//! Controller role - samples the potentiometer and streams angles
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};

use super::{fatal_check, show_status, should_stop, stop_and_join, MessageSink, RoleTick, CHANNEL_CAPACITY};
use crate::clock::SharedClock;
use crate::config::{ControllerConfig, LinkConfig};
use crate::contracts::{Message, MessageKind, Payload, Role};
use crate::errors::{LinkError, Result};
use crate::filter::{FilterState, RateFilter};
use crate::hardware::{DisplayStatus, Sensor, StatusDisplay};
use crate::session::{ConnectionSession, LinkState};

/// Matches STATUS echoes against sent DATA to estimate round-trip time
///
/// STATUS doubles as an implicit acknowledgement; this is bookkeeping, not
/// a retransmission protocol.
#[derive(Debug)]
pub struct ConfirmationTracker {
    in_flight: VecDeque<(u16, u64)>,
    capacity: usize,
    last_rtt_ms: Option<u64>,
    confirmed: u64,
    unconfirmed: u64,
}

impl ConfirmationTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            last_rtt_ms: None,
            confirmed: 0,
            unconfirmed: 0,
        }
    }

    pub fn record(&mut self, sequence: u16, sent_ms: u64) {
        if self.in_flight.len() == self.capacity {
            self.in_flight.pop_front();
            self.unconfirmed += 1;
        }
        self.in_flight.push_back((sequence, sent_ms));
    }

    /// Confirm `sequence`; older entries still waiting are given up on
    pub fn confirm(&mut self, sequence: u16, now_ms: u64) -> Option<u64> {
        let index = self.in_flight.iter().position(|(seq, _)| *seq == sequence)?;
        self.unconfirmed += index as u64;
        let (_, sent_ms) = self.in_flight.drain(..=index).last()?;
        let rtt = now_ms.saturating_sub(sent_ms);
        self.last_rtt_ms = Some(rtt);
        self.confirmed += 1;
        Some(rtt)
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn last_rtt_ms(&self) -> Option<u64> {
        self.last_rtt_ms
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn unconfirmed(&self) -> u64 {
        self.unconfirmed
    }
}

pub struct Controller<S: Sensor, D: StatusDisplay> {
    sensor: S,
    display: D,
    filter: RateFilter,
    filter_state: FilterState,
    tracker: ConfirmationTracker,
    clock: SharedClock,
    sample_interval_ms: u64,
    next_sample_ms: u64,
    last_reading: Option<f32>,
    last_sent: Option<u16>,
    was_connected: bool,
}

impl<S: Sensor, D: StatusDisplay> Controller<S, D> {
    pub fn new(
        sensor: S,
        display: D,
        filter: RateFilter,
        config: &ControllerConfig,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            sensor,
            display,
            filter,
            filter_state: FilterState::new(),
            tracker: ConfirmationTracker::new(config.max_in_flight),
            clock,
            sample_interval_ms: config.sample_interval_ms,
            next_sample_ms: now,
            last_reading: None,
            last_sent: None,
            was_connected: false,
        }
    }

    pub fn from_config(sensor: S, display: D, config: &LinkConfig, clock: SharedClock) -> Self {
        Self::new(
            sensor,
            display,
            RateFilter::new(config.filter.clone()),
            &config.controller,
            clock,
        )
    }

    pub fn tracker(&self) -> &ConfirmationTracker {
        &self.tracker
    }

    pub fn filter_state(&self) -> &FilterState {
        &self.filter_state
    }

    pub fn last_sent(&self) -> Option<u16> {
        self.last_sent
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    fn handle_inbound(&mut self, message: &Message, now: u64) {
        match message.kind {
            MessageKind::Status | MessageKind::Ack => match message.acknowledged() {
                Some(ack) => match self.tracker.confirm(ack, now) {
                    Some(rtt) => debug!(
                        "#{} applied at {:?} ({} ms round trip)",
                        ack, message.payload.angle, rtt
                    ),
                    None => debug!("late confirmation for #{}", ack),
                },
                None => info!("receiver status: {}", message),
            },
            MessageKind::Error => {
                if let Some(ack) = message.acknowledged() {
                    self.tracker.confirm(ack, now);
                }
                warn!(
                    "receiver reported failure: {}",
                    message.payload.status.as_deref().unwrap_or("unknown")
                );
            }
            MessageKind::Data | MessageKind::Heartbeat => {
                debug!("ignoring {} from receiver", message);
            }
        }
    }

    /// Sample the sensor if due and send it when the filter lets it through
    fn sample<M: MessageSink>(&mut self, sink: &mut M, now: u64) {
        if now < self.next_sample_ms {
            return;
        }
        self.next_sample_ms = now + self.sample_interval_ms;

        let connected = sink.state() == LinkState::Connected;
        if connected && !self.was_connected {
            // the receiver may have missed everything since the last link
            self.filter_state.reset();
            self.tracker.clear();
        }
        self.was_connected = connected;

        let angle = match self.sensor.read() {
            Ok(angle) => angle,
            Err(e) => {
                warn!("skipping sample: {}", e);
                return;
            }
        };
        self.last_reading = Some(angle);

        if !connected || !self.filter.should_send(angle, &mut self.filter_state, now) {
            return;
        }

        match sink.send(MessageKind::Data, Payload::angle(angle)) {
            Ok(sequence) => {
                self.tracker.record(sequence, now);
                self.last_sent = Some(sequence);
            }
            Err(LinkError::NotConnected(state)) => {
                debug!("dropping {:.1}: link {}", angle, state)
            }
            Err(e) => warn!("send of {:.1} failed: {}", angle, e),
        }
    }

    fn refresh_display(&mut self, state: LinkState) {
        let status = DisplayStatus {
            role: Role::Controller,
            state,
            sequence: self.last_sent,
            value: self.last_reading,
            rtt_ms: self.tracker.last_rtt_ms(),
        };
        show_status(&mut self.display, &status);
    }

    /// Threaded model: this thread samples and sends, `link-rx` receives
    pub fn run_threaded(mut self, session: ConnectionSession, shutdown: Arc<AtomicBool>) -> Result<()> {
        let handle = session.handle();
        let poll = session.config().poll_timeout();
        let (mut sender, mut receiver) = session.split();
        let (tx, rx) = bounded::<Message>(CHANNEL_CAPACITY);

        let rx_shutdown = shutdown.clone();
        let rx_handle = handle.clone();
        let worker = thread::Builder::new()
            .name("link-rx".to_string())
            .spawn(move || {
                while !should_stop(&rx_shutdown, &rx_handle) {
                    for message in receiver.poll() {
                        if tx.try_send(message).is_err() {
                            warn!("inbound queue full, dropping message");
                        }
                    }
                    if !receiver.has_transport() {
                        thread::sleep(poll);
                    }
                }
                debug!("receive thread exiting");
            })
            .map_err(|e| LinkError::Runtime(format!("failed to spawn receive thread: {}", e)))?;

        info!("controller running threaded");
        let period = Duration::from_millis(self.sample_interval_ms);
        let result = loop {
            if shutdown.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(e) = fatal_check(&handle) {
                break Err(e);
            }

            let now = self.clock.now_ms();
            while let Ok(message) = rx.try_recv() {
                self.handle_inbound(&message, now);
            }
            self.sample(&mut sender, now);
            if let Err(e) = sender.service() {
                debug!("control traffic skipped: {}", e);
            }
            self.refresh_display(sender.state());

            match rx.recv_timeout(period) {
                Ok(message) => self.handle_inbound(&message, self.clock.now_ms()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break fatal_check(&handle),
            }
        };

        stop_and_join(&handle, worker);
        self.refresh_display(handle.state());
        result
    }
}

impl<S: Sensor, D: StatusDisplay> RoleTick for Controller<S, D> {
    fn tick(&mut self, session: &mut ConnectionSession) -> Result<()> {
        let delivered = session.tick();
        let now = self.clock.now_ms();
        for message in &delivered {
            self.handle_inbound(message, now);
        }
        fatal_check(&session.handle())?;

        self.sample(session, now);
        self.refresh_display(session.state());
        Ok(())
    }
}
