//! Protocol versions and the connection-opening handshake.
//!
//! Handshake layout (client → server, 20 bytes):
//!
//! ```text
//! +-------------+-----------+-----------+-----------+-----------+
//! | preamble    | proposal1 | proposal2 | proposal3 | proposal4 |
//! | 60 60 B0 17 |  u32 BE   |  u32 BE   |  u32 BE   |  u32 BE   |
//! +-------------+-----------+-----------+-----------+-----------+
//! ```
//!
//! The server answers with the chosen version as a `u32 BE`, or four zero
//! bytes when none of the proposals is supported.

use crate::error::ProtocolError;
use std::fmt;

/// Magic bytes opening every connection.
pub const PREAMBLE: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Size of the client handshake in bytes (preamble + 4 proposals).
pub const HANDSHAKE_SIZE: usize = 20;

/// Server reply when no proposal is acceptable.
pub const NO_VERSION: [u8; 4] = [0, 0, 0, 0];

/// A protocol version.
///
/// Each version is a strict superset of the previous one's wire-visible
/// behavior. The version is fixed for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Graph structures, autocommit-only RUN.
    V1,
    /// Adds byte arrays and spatial/temporal structures.
    V2,
    /// Adds HELLO, GOODBYE, explicit transactions and RUN metadata.
    V3,
}

impl ProtocolVersion {
    /// All versions this implementation can serve, newest first.
    pub const ALL: [ProtocolVersion; 3] =
        [ProtocolVersion::V3, ProtocolVersion::V2, ProtocolVersion::V1];

    /// Returns the numeric identifier used on the wire.
    pub fn number(self) -> u32 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            _ => None,
        }
    }

    /// Byte arrays and spatial/temporal structures.
    pub fn supports_extended_values(self) -> bool {
        self >= ProtocolVersion::V2
    }

    /// BEGIN/COMMIT/ROLLBACK and the transaction states.
    pub fn supports_transactions(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// HELLO replaces INIT and GOODBYE becomes available.
    pub fn uses_hello(self) -> bool {
        self >= ProtocolVersion::V3
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

impl TryFrom<u32> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(number: u32) -> Result<Self, Self::Error> {
        Self::from_number(number).ok_or(ProtocolError::UnsupportedVersion(number))
    }
}

/// A parsed client handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Version proposals in client preference order. Zero marks an empty slot.
    pub proposals: [u32; 4],
}

impl Handshake {
    pub fn new(proposals: [u32; 4]) -> Self {
        Self { proposals }
    }

    /// Decodes the 20-byte client handshake.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HANDSHAKE_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HANDSHAKE_SIZE - buf.len(),
            });
        }

        let preamble: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
        if preamble != PREAMBLE {
            return Err(ProtocolError::InvalidPreamble(preamble));
        }

        let mut proposals = [0u32; 4];
        for (i, slot) in proposals.iter_mut().enumerate() {
            let at = 4 + i * 4;
            *slot = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        }

        Ok(Self { proposals })
    }

    /// Encodes the handshake as a client would send it.
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[..4].copy_from_slice(&PREAMBLE);
        for (i, proposal) in self.proposals.iter().enumerate() {
            let at = 4 + i * 4;
            out[at..at + 4].copy_from_slice(&proposal.to_be_bytes());
        }
        out
    }

    /// Picks the first proposal (in client order) present in `enabled`.
    pub fn negotiate(&self, enabled: &[ProtocolVersion]) -> Result<ProtocolVersion, ProtocolError> {
        self.proposals
            .iter()
            .filter(|&&p| p != 0)
            .filter_map(|&p| ProtocolVersion::from_number(p))
            .find(|v| enabled.contains(v))
            .ok_or(ProtocolError::NoSupportedVersion(self.proposals))
    }
}

/// Encodes the server's handshake reply.
pub fn encode_selection(version: Option<ProtocolVersion>) -> [u8; 4] {
    match version {
        Some(v) => v.number().to_be_bytes(),
        None => NO_VERSION,
    }
}
