//! Response dispatch.
//!
//! A [`ResponseHandler`] is created for every request and turns its outcome
//! into wire responses according to the request's [`Reply`] strategy.
//! Exactly one terminal response (SUCCESS, FAILURE or IGNORED) leaves a
//! handler; anything reported after that is dropped.
//!
//! [`ResponseWriter`] packs responses, chunks them and buffers the bytes
//! until the connection flushes.

use bytes::BytesMut;
use graphwire_protocol::{
    Chunker, Failure, MessageRegistry, ProtocolError, Reply, RequestKind, Response, ResponseKind,
    Value, ValueMap,
};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffered output above which record batches are flushed early.
pub const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Encodes and buffers outgoing responses.
pub struct ResponseWriter<W> {
    writer: W,
    registry: &'static MessageRegistry,
    chunker: Chunker,
    scratch: BytesMut,
    out: BytesMut,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(writer: W, registry: &'static MessageRegistry, chunker: Chunker) -> Self {
        Self {
            writer,
            registry,
            chunker,
            scratch: BytesMut::with_capacity(1024),
            out: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Packs and chunks `response` into the output buffer. On error nothing
    /// is buffered.
    pub fn queue(&mut self, response: &Response) -> Result<(), ProtocolError> {
        self.scratch.clear();
        self.registry.encode_response(response, &mut self.scratch)?;
        self.chunker.encode(&self.scratch, &mut self.out);
        Ok(())
    }

    /// Bytes waiting for [`ResponseWriter::flush`].
    pub fn pending(&self) -> usize {
        self.out.len()
    }

    /// Writes everything buffered so far. Each chunk header is already
    /// final when its bytes reach the transport.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&self.out).await?;
        self.writer.flush().await?;
        self.out.clear();
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.writer.shutdown().await
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}

/// How a handler call ended up on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A response was buffered.
    Sent(ResponseKind),
    /// The reply strategy or an earlier terminal response suppressed it.
    Dropped,
}

/// Turns the outcome of one request into responses.
#[derive(Debug)]
pub struct ResponseHandler {
    kind: RequestKind,
    reply: Reply,
    started: Instant,
    records: u64,
    done: bool,
}

impl ResponseHandler {
    pub fn new(kind: RequestKind, reply: Reply) -> Self {
        Self {
            kind,
            reply,
            started: Instant::now(),
            records: 0,
            done: false,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn reply(&self) -> Reply {
        self.reply
    }

    /// Records seen so far, whether sent or discarded.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the terminal response has been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn on_record<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut ResponseWriter<W>,
        values: Vec<Value>,
    ) -> Result<Delivery, ProtocolError> {
        if self.done {
            tracing::debug!("Dropping record for finished {}", self.kind);
            return Ok(Delivery::Dropped);
        }
        self.records += 1;
        match self.reply {
            Reply::Stream => {
                out.queue(&Response::Record(values))?;
                Ok(Delivery::Sent(ResponseKind::Record))
            }
            Reply::Discard | Reply::Summary | Reply::Silent => Ok(Delivery::Dropped),
        }
    }

    pub fn on_success<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut ResponseWriter<W>,
        metadata: ValueMap,
    ) -> Result<Delivery, ProtocolError> {
        self.terminal(out, Response::Success(metadata))
    }

    pub fn on_failure<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut ResponseWriter<W>,
        failure: Failure,
    ) -> Result<Delivery, ProtocolError> {
        self.terminal(out, Response::Failure(failure))
    }

    pub fn on_ignored<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut ResponseWriter<W>,
    ) -> Result<Delivery, ProtocolError> {
        self.terminal(out, Response::Ignored)
    }

    fn terminal<W: AsyncWrite + Unpin>(
        &mut self,
        out: &mut ResponseWriter<W>,
        response: Response,
    ) -> Result<Delivery, ProtocolError> {
        if self.done {
            tracing::debug!(
                "Dropping late {} for {}",
                response.kind().name(),
                self.kind
            );
            return Ok(Delivery::Dropped);
        }
        self.done = true;
        if self.reply == Reply::Silent {
            return Ok(Delivery::Dropped);
        }
        let kind = response.kind();
        out.queue(&response)?;
        Ok(Delivery::Sent(kind))
    }
}
