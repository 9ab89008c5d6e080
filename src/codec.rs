//! Frame codec - self-delimited frames over a byte stream
//!
//! # Frame Layout
//! ```text
//! +------+------+-----------+-------------------+-----------------+
//! | 0xA5 | 0x5A | len (u16) | body (len bytes)  | crc32 (u32)     |
//! +------+------+-----------+-------------------+-----------------+
//! ```
//! - `len` and `crc32` are little-endian
//! - `crc32` covers the length field and the body
//! - `body` is the rkyv archive of a [`Message`]
//!
//! Decoding never blocks and never fails hard: a short buffer is
//! `Incomplete`, a broken frame is `Invalid` together with the number of
//! bytes to drop so the caller lands on the next sync marker.
use log::warn;
use rkyv::{AlignedVec, Deserialize};

use crate::contracts::Message;
use crate::errors::{FrameError, LinkError, Result};
use crate::{FRAME_OVERHEAD, HEADER_LEN, SYNC_BYTE_1, SYNC_BYTE_2};

/// Scratch space hint for the rkyv serializer
const SERIALIZER_SCRATCH: usize = 256;

/// Outcome of one decode attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete, valid frame
    Message(Message),
    /// Not enough bytes yet; nothing should be consumed
    Incomplete,
    /// Structural failure; drop the reported prefix and retry
    Invalid(FrameError),
}

/// Stateless frame encoder/decoder bounded by a maximum frame size
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize a message into one frame
    ///
    /// # Errors
    /// `Serialization` if rkyv fails, `Frame(Oversized)` if the frame would
    /// exceed the configured maximum.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let body = rkyv::to_bytes::<_, SERIALIZER_SCRATCH>(message)
            .map_err(|e| LinkError::Serialization(format!("{:?}", e)))?;

        let size = FRAME_OVERHEAD + body.len();
        if size > self.max_frame_size || body.len() > u16::MAX as usize {
            return Err(FrameError::Oversized {
                size,
                max: self.max_frame_size,
            }
            .into());
        }

        let mut frame = Vec::with_capacity(size);
        frame.push(SYNC_BYTE_1);
        frame.push(SYNC_BYTE_2);
        frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
        frame.extend_from_slice(&body);
        let crc = crc32fast::hash(&frame[2..]);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Try to decode one frame from the front of `buffer`
    ///
    /// Returns the outcome and the number of bytes the caller must consume.
    /// `Incomplete` always consumes 0; `Invalid` always consumes at least 1.
    pub fn decode(&self, buffer: &[u8]) -> (Decoded, usize) {
        if buffer.is_empty() {
            return (Decoded::Incomplete, 0);
        }

        if buffer[0] != SYNC_BYTE_1 || (buffer.len() > 1 && buffer[1] != SYNC_BYTE_2) {
            let skipped = find_sync(buffer, 1);
            return (Decoded::Invalid(FrameError::MissingSync { skipped }), skipped);
        }

        if buffer.len() < HEADER_LEN {
            return (Decoded::Incomplete, 0);
        }

        let body_len = u16::from_le_bytes([buffer[2], buffer[3]]) as usize;
        let max_body = self.max_frame_size.saturating_sub(FRAME_OVERHEAD);
        if body_len == 0 || body_len > max_body {
            let skip = find_sync(buffer, 1);
            return (
                Decoded::Invalid(FrameError::BadLength {
                    length: body_len,
                    max: max_body,
                }),
                skip,
            );
        }

        let total = FRAME_OVERHEAD + body_len;
        if buffer.len() < total {
            return (Decoded::Incomplete, 0);
        }

        let crc_offset = HEADER_LEN + body_len;
        let expected = u32::from_le_bytes([
            buffer[crc_offset],
            buffer[crc_offset + 1],
            buffer[crc_offset + 2],
            buffer[crc_offset + 3],
        ]);
        let actual = crc32fast::hash(&buffer[2..crc_offset]);
        if expected != actual {
            // The length field itself may be the corrupted part, so rescan
            // instead of trusting it to skip the whole frame.
            let skip = find_sync(buffer, 1);
            return (
                Decoded::Invalid(FrameError::ChecksumMismatch { expected, actual }),
                skip,
            );
        }

        match decode_body(&buffer[HEADER_LEN..crc_offset]) {
            Ok(message) => (Decoded::Message(message), total),
            Err(err) => (Decoded::Invalid(err), total),
        }
    }
}

/// Validate and deserialize an archived message body
fn decode_body(body: &[u8]) -> std::result::Result<Message, FrameError> {
    // Slices inside the stream buffer carry no alignment guarantee
    let mut aligned = AlignedVec::with_capacity(body.len());
    aligned.extend_from_slice(body);

    let archived = rkyv::check_archived_root::<Message>(&aligned[..])
        .map_err(|_| FrameError::Malformed("archive validation failed".to_string()))?;

    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| FrameError::Malformed("archive deserialization failed".to_string()))
}

/// Offset of the next plausible frame start at or after `from`
///
/// A lone `SYNC_BYTE_1` at the very end counts, since its partner may
/// still be in flight.
fn find_sync(buffer: &[u8], from: usize) -> usize {
    (from..buffer.len())
        .find(|&i| {
            buffer[i] == SYNC_BYTE_1 && (i + 1 == buffer.len() || buffer[i + 1] == SYNC_BYTE_2)
        })
        .unwrap_or(buffer.len())
}

/// Streaming accumulator in front of [`FrameCodec`]
///
/// Holds at most `2 * max_frame_size` bytes. When a stalled or garbage
/// stream overflows it, the oldest bytes are dropped.
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
    capacity: usize,
    dropped_bytes: u64,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        let capacity = codec.max_frame_size() * 2;
        Self {
            codec,
            buffer: Vec::with_capacity(capacity),
            capacity,
            dropped_bytes: 0,
        }
    }

    /// Append freshly read bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > self.capacity {
            let excess = self.buffer.len() - self.capacity;
            self.buffer.drain(..excess);
            self.dropped_bytes += excess as u64;
            warn!("frame buffer overflow, dropped {} oldest bytes", excess);
        }
    }

    /// Next decoded frame, `None` once only an incomplete tail remains
    pub fn next_frame(&mut self) -> Option<std::result::Result<Message, FrameError>> {
        let (decoded, consumed) = self.codec.decode(&self.buffer);
        self.buffer.drain(..consumed);
        match decoded {
            Decoded::Message(message) => Some(Ok(message)),
            Decoded::Invalid(err) => Some(Err(err)),
            Decoded::Incomplete => None,
        }
    }

    /// Discard everything buffered (new connection)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }
}
