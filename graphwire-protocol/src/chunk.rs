//! Chunk framing.
//!
//! A message travels as one or more chunks followed by an end marker:
//!
//! ```text
//! +--------+-----------+--------+-----------+-----+-------+
//! | len    | payload   | len    | payload   | ... | 00 00 |
//! | u16 BE | len bytes | u16 BE | len bytes |     |       |
//! +--------+-----------+--------+-----------+-----+-------+
//! ```
//!
//! Chunk boundaries carry no meaning; only the zero-length chunk ends a
//! message.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of a chunk length header.
pub const CHUNK_HEADER_SIZE: usize = 2;

/// Largest chunk body a 16-bit header can describe.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// Zero-length chunk terminating every message.
pub const END_OF_MESSAGE: [u8; 2] = [0x00, 0x00];

/// Splits outgoing messages into chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chunk_size: usize,
}

impl Chunker {
    /// Creates a chunker emitting chunks of at most `max_chunk_size` bytes.
    pub fn new(max_chunk_size: usize) -> Result<Self, ProtocolError> {
        if max_chunk_size == 0 || max_chunk_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(max_chunk_size));
        }
        Ok(Self { max_chunk_size })
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Appends `message` to `out` as chunks plus the end marker.
    ///
    /// Each chunk header is reserved first and backfilled once the body is
    /// written, so a chunk is complete before any of `out` is flushed.
    pub fn encode(&self, message: &[u8], out: &mut BytesMut) {
        let chunks = message.len().div_ceil(self.max_chunk_size);
        out.reserve(message.len() + (chunks + 1) * CHUNK_HEADER_SIZE);

        for body in message.chunks(self.max_chunk_size) {
            let header_at = out.len();
            out.put_u16(0);
            out.put_slice(body);
            let len = (out.len() - header_at - CHUNK_HEADER_SIZE) as u16;
            out[header_at..header_at + CHUNK_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
        }
        out.put_slice(&END_OF_MESSAGE);
    }

    /// Chunks `message` into a fresh buffer.
    pub fn to_bytes(&self, message: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        self.encode(message, &mut out);
        out
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

/// Reassembles messages from an incoming byte stream.
///
/// Holds per-connection state: bytes not yet forming a whole chunk, and the
/// message accumulated since the last end marker.
#[derive(Debug)]
pub struct Dechunker {
    buffer: BytesMut,
    message: BytesMut,
    max_message_size: usize,
}

impl Dechunker {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            message: BytesMut::new(),
            max_message_size,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Receive buffer for reading from a socket without an extra copy.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    ///
    /// Empty messages (an end marker directly after another) are skipped.
    /// A chunk that would grow the message past the limit fails before its
    /// body has arrived.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            if self.buffer.len() < CHUNK_HEADER_SIZE {
                return Ok(None);
            }

            let len = usize::from(u16::from_be_bytes([self.buffer[0], self.buffer[1]]));
            if len == 0 {
                self.buffer.advance(CHUNK_HEADER_SIZE);
                if self.message.is_empty() {
                    continue;
                }
                return Ok(Some(self.message.split().freeze()));
            }

            let size = self.message.len() + len;
            if size > self.max_message_size {
                return Err(ProtocolError::FrameTooLarge {
                    size,
                    max: self.max_message_size,
                });
            }

            if self.buffer.len() < CHUNK_HEADER_SIZE + len {
                return Ok(None);
            }

            self.buffer.advance(CHUNK_HEADER_SIZE);
            self.message.extend_from_slice(&self.buffer[..len]);
            self.buffer.advance(len);
        }
    }

    /// Bytes received but not yet part of an emitted message.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.message.len()
    }

    /// Returns whether a message is partially assembled.
    pub fn in_message(&self) -> bool {
        !self.message.is_empty()
    }

    /// Drops all buffered state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.message.clear();
    }
}
