//! # graphwire-protocol
//!
//! Wire protocol for the graphwire server.
//!
//! This crate provides:
//! - The value model shared by clients, server and query engine
//! - A compact binary value codec with per-version structure tables
//! - Chunk framing of messages over a byte stream
//! - Typed request/response messages and per-version message registries
//! - The version handshake
//!
//! It performs no I/O.

pub mod chunk;
pub mod error;
pub mod message;
pub mod packstream;
pub mod registry;
pub mod value;
pub mod version;

pub use chunk::{Chunker, Dechunker, CHUNK_HEADER_SIZE, END_OF_MESSAGE, MAX_CHUNK_SIZE};
pub use error::{ProtocolError, Status};
pub use message::{Failure, Request, RequestKind, Response, ResponseKind, TxMetadata};
pub use packstream::{Packer, Unpacker, MAX_NESTING_DEPTH};
pub use registry::{DecodeError, MessageRegistry, Reply, RequestDecoder, ResponseEncoder};
pub use value::{Value, ValueMap};
pub use version::{Handshake, ProtocolVersion, HANDSHAKE_SIZE, PREAMBLE};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 7687;

/// Default maximum size of one reassembled message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
