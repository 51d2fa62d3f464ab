//! Query engine interface.
//!
//! The connection actor never interprets statements. It hands a [`Query`]
//! to a [`QueryEngine`] and consumes the [`ResultStream`] it returns:
//! records flow over a bounded channel from whatever task produces them,
//! ending in exactly one [`StreamEvent::Done`] or [`StreamEvent::Failed`].
//! A producer that observes cancellation stops sending and drops its
//! sender; the closed channel is the acknowledgement.

use graphwire_protocol::{Status, TxMetadata, Value, ValueMap};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records buffered between a producer and the connection.
pub const RESULT_CHANNEL_CAPACITY: usize = 64;

/// Summary key under which an engine reports the bookmark of committed work.
pub const BOOKMARK_KEY: &str = "bookmark";

/// A statement to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub statement: String,
    pub parameters: ValueMap,
    pub metadata: TxMetadata,
}

impl Query {
    pub fn new(statement: impl Into<String>, parameters: ValueMap) -> Self {
        Self {
            statement: statement.into(),
            parameters,
            metadata: TxMetadata::default(),
        }
    }
}

/// Handle of an explicit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A failure reported by the engine. The code is sent to clients verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: String,
    pub message: String,
}

impl EngineError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn from_status(status: Status, message: impl Into<String>) -> Self {
        Self::new(status.code(), message)
    }
}

/// One item produced for a running query.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Record(Vec<Value>),
    /// Summary metadata, merged into the terminal SUCCESS.
    Done(ValueMap),
    Failed(EngineError),
}

/// Output of a query accepted by the engine.
#[derive(Debug)]
pub struct ResultStream {
    fields: Vec<String>,
    receiver: mpsc::Receiver<StreamEvent>,
}

impl ResultStream {
    pub fn new(fields: Vec<String>, receiver: mpsc::Receiver<StreamEvent>) -> Self {
        Self { fields, receiver }
    }

    /// Column names, known before any record is produced.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Receives the next event. `None` means the producer went away
    /// without a terminal event, which only happens after cancellation.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`ResultStream::next`], used to batch
    /// already produced records into one write.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }

    /// Closes the channel, discards what is buffered and waits for any
    /// send already holding a permit.
    pub async fn drain(&mut self) {
        self.receiver.close();
        while self.receiver.recv().await.is_some() {}
    }
}

/// Executes statements and manages explicit transactions.
///
/// `execute` must return promptly; record production happens on a task
/// spawned by the engine. Implementations must stop producing once
/// `cancel` fires.
pub trait QueryEngine: Send + Sync + 'static {
    fn execute(
        &self,
        query: Query,
        tx: Option<TxId>,
        cancel: CancellationToken,
    ) -> Result<ResultStream, EngineError>;

    fn begin(&self, metadata: &TxMetadata) -> Result<TxId, EngineError>;

    /// Commits and returns the bookmark of the committed work.
    fn commit(&self, tx: TxId) -> Result<String, EngineError>;

    fn rollback(&self, tx: TxId) -> Result<(), EngineError>;
}
