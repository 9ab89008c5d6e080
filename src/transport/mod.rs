//! Transport layer for byte-stream I/O
//!
//! The session only needs "deliver bytes / receive bytes, possibly
//! partial". Both peer-to-peer TCP and the relay hub look the same at this
//! level, so the codec and protocol never see which one is in use.

use std::time::Duration;

use crate::config::SessionConfig;
use crate::errors::Result;

pub mod mock;
mod tcp;

pub use tcp::{TcpAcceptor, TcpDialer, TcpTransport};

/// Established byte stream to the peer
pub trait Transport: Send {
    /// Read whatever is available into `buffer`
    ///
    /// `Ok(0)` means nothing arrived within the poll window. A closed peer
    /// is reported as `TransportFault`, never as `Ok(0)`.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write the whole frame or fail; partial writes are retried internally
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Close both directions; other handles to the same stream see a fault
    fn close(&mut self);

    /// Independent handle for the other session half
    fn try_clone(&self) -> Result<Box<dyn Transport>>;

    /// Peer description for logs
    fn peer(&self) -> String {
        "peer".to_string()
    }
}

/// Produces transports without blocking
pub trait Connector: Send {
    /// Advance the current connect attempt
    ///
    /// `Ok(None)` while still pending, `Ok(Some(_))` once established.
    /// An error ends the attempt.
    fn poll_connect(&mut self) -> Result<Option<Box<dyn Transport>>>;

    /// Abandon a pending attempt (timeout or shutdown)
    fn abort(&mut self) {}

    /// Whether this side waits for the peer to dial in
    ///
    /// A passive connector that simply has nobody to talk to yet is not
    /// failing, so the session does not count its idle timeouts.
    fn is_passive(&self) -> bool {
        false
    }

    /// Whether an established transport ends at a relay rather than the peer
    ///
    /// The peer may join the relay later, so a missing handshake on such a
    /// transport is waited out instead of counted as a failed attempt.
    fn is_rendezvous(&self) -> bool {
        false
    }
}

/// How reads behave on an established stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Block up to the poll timeout (dedicated receive thread)
    Blocking { poll_timeout: Duration },
    /// Return immediately (cooperative tick)
    NonBlocking,
}

/// I/O settings applied to every stream a connector produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub read_mode: ReadMode,
    pub write_timeout: Duration,
}

impl StreamSettings {
    /// Settings for the threaded scheduling model
    pub fn threaded(config: &SessionConfig) -> Self {
        Self {
            read_mode: ReadMode::Blocking {
                poll_timeout: config.poll_timeout(),
            },
            write_timeout: config.write_timeout(),
        }
    }

    /// Settings for the cooperative scheduling model
    pub fn cooperative(config: &SessionConfig) -> Self {
        Self {
            read_mode: ReadMode::NonBlocking,
            write_timeout: config.write_timeout(),
        }
    }
}
