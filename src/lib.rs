//! SmartMotor Link - resilient messaging between a sensor node and an actuator node
//!
//! **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
//!
//! A controller samples a potentiometer and streams angles to a receiver that
//! drives a servo. The link between them is assumed to be flaky: connections
//! drop, writes go out in pieces and peers stall without closing.
//!
//! # Layers
//! - [`codec`]: self-delimited, checksummed frames with stream resync
//! - [`protocol`]: message kinds, payload validation, sequence acceptance
//! - [`filter`]: dead-zone and rate limiting of outbound values
//! - [`session`]: connect, handshake, liveness, recovery and backoff
//! - [`roles`]: controller and receiver orchestration
//!
//! # Scheduling
//! Both a threaded model (send and receive on dedicated threads) and a
//! cooperative `tick()` model are supported on top of the same session.

pub mod backoff;
pub mod clock;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod errors;
pub mod filter;
pub mod hardware;
pub mod protocol;
pub mod relay;
pub mod roles;
pub mod session;
pub mod transport;

pub use codec::{Decoded, FrameCodec, FrameDecoder};
pub use config::LinkConfig;
pub use contracts::{Message, MessageKind, Payload, Role};
pub use errors::{FrameError, HardwareError, LinkError, ProtocolError, Result};
pub use filter::{FilterState, RateFilter};
pub use protocol::{Decision, MessageProtocol};
pub use session::{ConnectionSession, LinkState};

/// Link protocol version, announced in the handshake
pub const LINK_VERSION: u16 = 1;

/// Default TCP port of the receiver
pub const DEFAULT_PORT: u16 = 4080;

/// First frame sync byte
pub const SYNC_BYTE_1: u8 = 0xA5;

/// Second frame sync byte
pub const SYNC_BYTE_2: u8 = 0x5A;

/// Sync marker plus `u16` body length
pub const HEADER_LEN: usize = 4;

/// Trailing CRC32
pub const CHECKSUM_LEN: usize = 4;

/// Bytes a frame adds around its body
pub const FRAME_OVERHEAD: usize = HEADER_LEN + CHECKSUM_LEN;

/// Smallest configurable frame size; fits any message with a short status
pub const MIN_FRAME_SIZE: usize = 96;

/// Largest configurable frame size
pub const MAX_FRAME_SIZE_LIMIT: usize = 4096;
