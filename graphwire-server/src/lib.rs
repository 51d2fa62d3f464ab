//! # graphwire-server
//!
//! Server side of the graphwire protocol.
//!
//! This crate provides:
//! - TCP accept loop with version handshake and optional TLS
//! - Per-version pipelines (framing, codec, state graph)
//! - A per-connection actor with pipelining and immediate RESET
//! - Response dispatch with record streaming and batching
//! - Token-based authentication of INIT/HELLO
//! - The [`QueryEngine`] seam and a small reference engine
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod literal;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod state;
pub mod stream;
pub mod tls;

pub use auth::{Authenticator, Principal, TokenAuthenticator};
pub use config::{AuthConfig, Config, MetricsConfig, NetworkConfig, ProtocolConfig, TlsConfig};
pub use connection::{Connection, ConnectionContext};
pub use engine::{EngineError, Query, QueryEngine, ResultStream, StreamEvent, TxId};
pub use error::ServerError;
pub use literal::LiteralEngine;
pub use metrics::Metrics;
pub use pipeline::Pipeline;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::Session;
pub use state::{Action, Decision, State, StateGraph};
