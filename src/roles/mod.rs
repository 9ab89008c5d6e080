//! Device roles on top of a connection session
//!
//! Each role supports both scheduling models:
//! - `tick()` for a single cooperative loop (see [`run_cooperative`])
//! - `run_threaded()` with dedicated send and receive threads
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::contracts::{MessageKind, Payload};
use crate::errors::{LinkError, Result};
use crate::hardware::{DisplayStatus, StatusDisplay};
use crate::session::{ConnectionSession, LinkState, SessionHandle, SessionSender};

pub mod controller;
pub mod receiver;

pub use controller::{ConfirmationTracker, Controller};
pub use receiver::Receiver;

/// Capacity of the channel between the receive and send threads
pub(crate) const CHANNEL_CAPACITY: usize = 64;

/// Anything an application message can be sent through
pub trait MessageSink {
    fn send(&mut self, kind: MessageKind, payload: Payload) -> Result<u16>;
    fn state(&self) -> LinkState;
}

impl MessageSink for ConnectionSession {
    fn send(&mut self, kind: MessageKind, payload: Payload) -> Result<u16> {
        ConnectionSession::send(self, kind, payload)
    }

    fn state(&self) -> LinkState {
        ConnectionSession::state(self)
    }
}

impl MessageSink for SessionSender {
    fn send(&mut self, kind: MessageKind, payload: Payload) -> Result<u16> {
        SessionSender::send(self, kind, payload)
    }

    fn state(&self) -> LinkState {
        SessionSender::state(self)
    }
}

/// One cooperative step of a role
pub trait RoleTick {
    fn tick(&mut self, session: &mut ConnectionSession) -> Result<()>;
}

/// Drive a role from a single thread until shutdown or FATAL
///
/// Every call inside `tick` is non-blocking, so `period` alone sets the
/// loop rate.
pub fn run_cooperative<R: RoleTick>(
    role: &mut R,
    session: &mut ConnectionSession,
    shutdown: &AtomicBool,
    period: Duration,
) -> Result<()> {
    info!("{} running cooperatively ({:?} tick)", session.role(), period);
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        if let Err(e) = role.tick(session) {
            break Err(e);
        }
        thread::sleep(period);
    };
    session.shutdown();
    result
}

/// `Fatal` error if the session gave up
pub(crate) fn fatal_check(handle: &SessionHandle) -> Result<()> {
    if handle.state().is_fatal() {
        let reason = handle
            .snapshot()
            .fatal_reason
            .unwrap_or_else(|| "reconnect attempts exhausted".to_string());
        return Err(LinkError::Fatal(reason));
    }
    Ok(())
}

/// Update a display without letting its failure reach the link
pub(crate) fn show_status<D: StatusDisplay>(display: &mut D, status: &DisplayStatus) {
    if let Err(e) = display.show(status) {
        warn!("display update failed: {}", e);
    }
}

/// Stop flag shared by both threads of a threaded role
pub(crate) fn should_stop(shutdown: &AtomicBool, handle: &SessionHandle) -> bool {
    shutdown.load(Ordering::SeqCst) || handle.is_shut_down() || handle.state().is_fatal()
}

/// Shut the session down and wait for the receive thread
///
/// The receive thread observes `handle.is_shut_down()` within one poll.
pub(crate) fn stop_and_join(handle: &SessionHandle, worker: thread::JoinHandle<()>) {
    handle.shutdown();
    if worker.join().is_err() {
        warn!("receive thread panicked");
    }
}
