//! Per-connection actor.
//!
//! One task owns a connection after its version handshake. It keeps reading
//! while a result is being pulled, so a RESET is seen the moment it arrives:
//! decoding it bumps the session's interrupt counter, fires the cancellation
//! token and answers the in-flight PULL with IGNORED. A GOODBYE likewise acts
//! when decoded and closes the connection without draining anything. All
//! other requests wait in the inbox and are processed strictly in arrival
//! order once nothing is streaming; while a RESET is pending they are
//! answered IGNORED. Responses are buffered and written in batches.

use crate::auth::Authenticator;
use crate::dispatch::{Delivery, ResponseHandler, ResponseWriter, FLUSH_THRESHOLD};
use crate::engine::{Query, QueryEngine, ResultStream, StreamEvent, BOOKMARK_KEY};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::session::Session;
use crate::state::{Action, Decision, State, StateGraph};
use graphwire_protocol::{
    DecodeError, Dechunker, Failure, MessageRegistry, ProtocolError, Reply, Request, RequestKind,
    Response, ResponseKind, Status, Value, ValueMap,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::broadcast;

/// Bytes reserved in the read buffer before each read.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Decoded requests held while a result is streaming. Reading pauses once
/// the inbox is full.
const MAX_PENDING_REQUESTS: usize = 1024;

/// Records written per batch before yielding back to the read loop.
const RECORD_BATCH: usize = 256;

/// Services shared by every connection of a server.
pub struct ConnectionContext {
    pub engine: Arc<dyn QueryEngine>,
    pub authenticator: Arc<dyn Authenticator>,
    pub metrics: Option<Arc<Metrics>>,
    /// Reported as `server` in the INIT/HELLO SUCCESS.
    pub server_agent: String,
    pub idle_timeout: Duration,
    /// How long RESET waits for a cancelled execution to stop.
    pub reset_timeout: Duration,
}

/// A request waiting to be processed.
enum Inbound {
    Request {
        request: Request,
        handler: ResponseHandler,
    },
    /// A message whose signature this version does not know.
    Unknown(u8),
    /// A well-formed message with unacceptable field values.
    Invalid {
        handler: ResponseHandler,
        reason: String,
    },
}

/// The PULL_ALL or DISCARD_ALL currently consuming the session's result.
struct Pulling {
    handler: ResponseHandler,
    next: State,
}

enum Flow {
    Continue,
    Close,
}

/// A negotiated connection.
pub struct Connection<S> {
    session: Session,
    ctx: Arc<ConnectionContext>,
    registry: &'static MessageRegistry,
    graph: &'static StateGraph,
    dechunker: Dechunker,
    reader: ReadHalf<S>,
    writer: ResponseWriter<WriteHalf<S>>,
    inbox: VecDeque<Inbound>,
    pulling: Option<Pulling>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        remote_addr: SocketAddr,
        pipeline: Pipeline,
        ctx: Arc<ConnectionContext>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            session: Session::new(remote_addr, pipeline.version),
            ctx,
            registry: pipeline.registry,
            graph: pipeline.graph,
            dechunker: pipeline.dechunker,
            reader,
            writer: ResponseWriter::new(writer, pipeline.registry, pipeline.chunker),
            inbox: VecDeque::new(),
            pulling: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Serves the connection until the client leaves, a fatal error occurs
    /// or the server shuts down. Open work is cancelled and any open
    /// transaction rolled back on the way out.
    pub async fn run(mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), ServerError> {
        let result = self.serve(shutdown).await;
        self.release();
        tracing::debug!(
            "[{}] Session {} ended after {} requests in {:?}",
            self.session.remote_addr,
            self.session.id,
            self.session.request_count(),
            self.session.age()
        );
        result
    }

    async fn serve(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), ServerError> {
        loop {
            while self.pulling.is_none() {
                let Some(inbound) = self.inbox.pop_front() else {
                    break;
                };
                if let Flow::Close = self.process(inbound, shutdown).await? {
                    self.hang_up().await;
                    return Ok(());
                }
            }
            self.writer.flush().await?;

            let waiting = self.pulling.is_none();
            let can_read = self.inbox.len() < MAX_PENDING_REQUESTS;
            let idle_deadline =
                tokio::time::Instant::from_std(self.session.last_activity() + self.ctx.idle_timeout);

            let buffer = self.dechunker.buffer_mut();
            buffer.reserve(READ_BUFFER_SIZE);
            let result = self.session.result_mut();

            tokio::select! {
                read = self.reader.read_buf(buffer), if can_read => {
                    if read? == 0 {
                        if self.dechunker.buffered() > 0 {
                            tracing::debug!(
                                "[{}] Client closed mid-message",
                                self.session.remote_addr
                            );
                        } else {
                            tracing::debug!("[{}] Client disconnected", self.session.remote_addr);
                        }
                        return Ok(());
                    }
                    self.session.touch();
                    if let Flow::Close = self.receive()? {
                        self.hang_up().await;
                        return Ok(());
                    }
                }

                event = next_event(result), if !waiting => {
                    self.pump(event).await?;
                }

                _ = tokio::time::sleep_until(idle_deadline), if waiting => {
                    tracing::info!(
                        "[{}] Idle for {:?}, closing",
                        self.session.remote_addr,
                        self.session.idle_for()
                    );
                    return Ok(());
                }

                _ = shutdown.recv() => {
                    tracing::debug!(
                        "[{}] Closing connection for shutdown",
                        self.session.remote_addr
                    );
                    return Err(ServerError::ShuttingDown);
                }
            }
        }
    }

    /// Decodes every complete message in the read buffer into the inbox.
    /// Stops at a GOODBYE, which ends the connection on the spot.
    fn receive(&mut self) -> Result<Flow, ServerError> {
        while let Some(message) = self.dechunker.next_message()? {
            self.session.record_request();
            match self.registry.decode_request(&message) {
                Ok((request, reply)) => {
                    let kind = request.kind();
                    tracing::trace!("[{}] C: {}", self.session.remote_addr, kind);
                    self.count_request(kind.name());
                    match kind {
                        RequestKind::Reset => self.interrupt()?,
                        RequestKind::Goodbye => {
                            self.goodbye();
                            return Ok(Flow::Close);
                        }
                        _ => {}
                    }
                    self.inbox.push_back(Inbound::Request {
                        request,
                        handler: ResponseHandler::new(kind, reply),
                    });
                }
                Err(DecodeError::UnknownSignature(signature)) => {
                    tracing::debug!(
                        "[{}] C: unknown message {:#04x}",
                        self.session.remote_addr,
                        signature
                    );
                    self.count_request("UNKNOWN");
                    self.inbox.push_back(Inbound::Unknown(signature));
                }
                Err(DecodeError::Invalid { kind, reason }) => {
                    self.count_request(kind.name());
                    self.inbox.push_back(Inbound::Invalid {
                        handler: ResponseHandler::new(kind, Reply::Summary),
                        reason,
                    });
                }
                Err(DecodeError::Fatal(e)) => {
                    tracing::warn!(
                        "[{}] Undecodable message, closing: {}",
                        self.session.remote_addr,
                        e
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Registers a RESET the moment it is decoded.
    fn interrupt(&mut self) -> Result<(), ServerError> {
        let pending = self.session.interrupt();
        tracing::debug!(
            "[{}] Interrupted ({} RESET pending)",
            self.session.remote_addr,
            pending
        );
        if let Some(mut pulling) = self.pulling.take() {
            self.respond_ignored(&mut pulling.handler)?;
        }
        Ok(())
    }

    /// Abandons running work and everything still queued.
    fn goodbye(&mut self) {
        tracing::debug!(
            "[{}] GOODBYE with {} requests queued",
            self.session.remote_addr,
            self.inbox.len()
        );
        self.session.cancel_execution();
        self.pulling = None;
        self.inbox.clear();
    }

    /// Flushes what is already buffered and closes the write side.
    async fn hang_up(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("[{}] Shutdown after GOODBYE: {}", self.session.remote_addr, e);
        }
    }

    async fn process(
        &mut self,
        inbound: Inbound,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Flow, ServerError> {
        let state = self.session.state();
        // Only the handshake may run ahead of a RESET that is already queued.
        let interrupted = state != State::Connected && self.session.pending_interrupts() > 0;
        match inbound {
            Inbound::Unknown(signature) => {
                if state == State::Connected {
                    return Err(ServerError::Handshake(format!(
                        "unexpected message {:#04x} before INIT/HELLO",
                        signature
                    )));
                }
                self.writer.queue(&Response::Ignored)?;
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.ignored_total.with_label_values(&["UNKNOWN"]).inc();
                }
                Ok(Flow::Continue)
            }

            Inbound::Invalid {
                mut handler,
                reason,
            } => {
                tracing::debug!(
                    "[{}] Invalid {}: {}",
                    self.session.remote_addr,
                    handler.kind(),
                    reason
                );
                match state {
                    State::Connected => {
                        self.respond_failure(
                            &mut handler,
                            Failure::from_status(Status::RequestInvalid, reason.clone()),
                        )?;
                        self.writer.flush().await?;
                        Err(ProtocolError::InvalidRequest(reason).into())
                    }
                    _ if interrupted || matches!(state, State::Failed | State::Interrupted) => {
                        self.respond_ignored(&mut handler)?;
                        Ok(Flow::Continue)
                    }
                    _ => {
                        self.fail(
                            &mut handler,
                            Failure::from_status(Status::RequestInvalid, reason),
                        )?;
                        Ok(Flow::Continue)
                    }
                }
            }

            Inbound::Request {
                mut handler, ..
            } if interrupted && handler.kind() != RequestKind::Reset => {
                self.respond_ignored(&mut handler)?;
                Ok(Flow::Continue)
            }

            Inbound::Request {
                request,
                mut handler,
            } => match self.graph.decide(state, handler.kind()) {
                Decision::Close => {
                    self.goodbye();
                    Ok(Flow::Close)
                }
                Decision::Fatal => Err(ServerError::NotInitialized(handler.kind().name())),
                Decision::Ignore => {
                    self.respond_ignored(&mut handler)?;
                    Ok(Flow::Continue)
                }
                Decision::Accept {
                    action: Action::Reset,
                    ..
                } => {
                    self.reset(handler, shutdown).await?;
                    Ok(Flow::Continue)
                }
                Decision::Accept { action, next } => {
                    self.perform(action, request, next, handler).await?;
                    Ok(Flow::Continue)
                }
            },
        }
    }

    async fn perform(
        &mut self,
        action: Action,
        request: Request,
        next: State,
        mut handler: ResponseHandler,
    ) -> Result<(), ServerError> {
        match action {
            Action::Authenticate => self.authenticate(request, handler).await,
            Action::Run => self.run_query(request, next, &mut handler),
            Action::Pull | Action::Discard => {
                if self.session.result_mut().is_none() {
                    return self.fail(
                        &mut handler,
                        Failure::from_status(Status::UnknownError, "no result to consume"),
                    );
                }
                self.pulling = Some(Pulling { handler, next });
                Ok(())
            }
            Action::Begin => {
                let metadata = match request {
                    Request::Begin { metadata } => metadata,
                    other => return Err(misrouted(&other, action)),
                };
                match self.ctx.engine.begin(&metadata) {
                    Ok(tx) => {
                        tracing::debug!("[{}] BEGIN {}", self.session.remote_addr, tx);
                        self.session.set_tx(Some(tx));
                        self.session.set_state(next);
                        self.respond_success(&mut handler, ValueMap::new())
                    }
                    Err(e) => self.fail(&mut handler, Failure::new(e.code, e.message)),
                }
            }
            Action::Commit => {
                let Some(tx) = self.session.take_tx() else {
                    return self.fail(
                        &mut handler,
                        Failure::from_status(Status::TransactionNotFound, "no open transaction"),
                    );
                };
                match self.ctx.engine.commit(tx) {
                    Ok(bookmark) => {
                        tracing::debug!("[{}] COMMIT {} -> {}", self.session.remote_addr, tx, bookmark);
                        self.session.set_state(next);
                        self.respond_success(
                            &mut handler,
                            ValueMap::new().with(BOOKMARK_KEY, bookmark),
                        )
                    }
                    Err(e) => self.fail(&mut handler, Failure::new(e.code, e.message)),
                }
            }
            Action::Rollback => {
                let Some(tx) = self.session.take_tx() else {
                    return self.fail(
                        &mut handler,
                        Failure::from_status(Status::TransactionNotFound, "no open transaction"),
                    );
                };
                match self.ctx.engine.rollback(tx) {
                    Ok(()) => {
                        tracing::debug!("[{}] ROLLBACK {}", self.session.remote_addr, tx);
                        self.session.set_state(next);
                        self.respond_success(&mut handler, ValueMap::new())
                    }
                    Err(e) => self.fail(&mut handler, Failure::new(e.code, e.message)),
                }
            }
            Action::Reset => Err(misrouted(&request, action)),
        }
    }

    async fn authenticate(
        &mut self,
        request: Request,
        mut handler: ResponseHandler,
    ) -> Result<(), ServerError> {
        let token = request.auth_token().unwrap_or_default();
        let user_agent = request.user_agent().map(str::to_string);

        match self.ctx.authenticator.authenticate(&token) {
            Ok(principal) => {
                tracing::info!(
                    "[{}] {} as '{}' ({})",
                    self.session.remote_addr,
                    handler.kind(),
                    principal.name,
                    user_agent.as_deref().unwrap_or("unknown agent")
                );
                self.session.authenticate(principal, user_agent);
                if self.session.pending_interrupts() > 0 {
                    self.session.set_state(State::Interrupted);
                } else {
                    self.session.set_state(State::Ready);
                }

                let mut metadata = ValueMap::new().with("server", self.ctx.server_agent.as_str());
                if self.session.version().uses_hello() {
                    metadata.insert("connection_id", self.session.id.as_str());
                }
                self.respond_success(&mut handler, metadata)
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] Authentication failed: {}",
                    self.session.remote_addr,
                    e
                );
                self.respond_failure(
                    &mut handler,
                    Failure::from_status(Status::Unauthorized, e.to_string()),
                )?;
                self.writer.flush().await?;
                Err(ServerError::AuthFailed(e.to_string()))
            }
        }
    }

    fn run_query(
        &mut self,
        request: Request,
        next: State,
        handler: &mut ResponseHandler,
    ) -> Result<(), ServerError> {
        let (statement, parameters, metadata) = match request {
            Request::Run {
                statement,
                parameters,
                metadata,
            } => (statement, parameters, metadata),
            other => return Err(misrouted(&other, Action::Run)),
        };
        let tx = if self.session.state().in_transaction() {
            self.session.tx()
        } else {
            None
        };

        let query = Query {
            statement,
            parameters,
            metadata,
        };
        match self.ctx.engine.execute(query, tx, self.session.cancel_token()) {
            Ok(result) => {
                let fields: Vec<Value> = result
                    .fields()
                    .iter()
                    .map(|f| Value::from(f.as_str()))
                    .collect();
                let mut metadata = ValueMap::new().with("fields", fields);
                metadata.insert(self.timing_key(true), millis(handler.elapsed()));

                self.session.set_result(result);
                self.session.set_state(next);
                self.respond_success(handler, metadata)
            }
            Err(e) => self.fail(handler, Failure::new(e.code, e.message)),
        }
    }

    /// Processes a RESET. Only the last of several queued RESETs cleans up;
    /// the earlier ones are answered IGNORED.
    async fn reset(
        &mut self,
        mut handler: ResponseHandler,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        if self.session.acknowledge_interrupt() > 0 {
            return self.respond_ignored(&mut handler);
        }

        self.session.cancel_execution();
        if let Some(mut result) = self.session.take_result() {
            let limit = self.ctx.reset_timeout;
            tokio::select! {
                drained = tokio::time::timeout(limit, result.drain()) => {
                    if drained.is_err() {
                        tracing::warn!(
                            "[{}] Execution still running {:?} after RESET",
                            self.session.remote_addr,
                            limit
                        );
                        return Err(ServerError::ResetTimeout(limit));
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(
                        "[{}] Shutdown while waiting for RESET cleanup",
                        self.session.remote_addr
                    );
                    return Err(ServerError::ShuttingDown);
                }
            }
        }
        if let Some(tx) = self.session.take_tx() {
            if let Err(e) = self.ctx.engine.rollback(tx) {
                tracing::debug!(
                    "[{}] Rollback of {} on RESET: {}",
                    self.session.remote_addr,
                    tx,
                    e
                );
            }
        }

        self.session.renew_cancel_token();
        self.session.set_state(State::Ready);
        self.respond_success(&mut handler, ValueMap::new())
    }

    /// Handles one stream event, then whatever else is already buffered,
    /// and flushes.
    async fn pump(&mut self, first: Option<StreamEvent>) -> Result<(), ServerError> {
        let mut event = first;
        for _ in 0..RECORD_BATCH {
            if !self.on_event(event)? || self.writer.pending() >= FLUSH_THRESHOLD {
                break;
            }
            match self.session.result_mut().and_then(ResultStream::try_next) {
                Some(e) => event = Some(e),
                None => break,
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Returns whether the pull is still going.
    fn on_event(&mut self, event: Option<StreamEvent>) -> Result<bool, ServerError> {
        let Some(mut pulling) = self.pulling.take() else {
            return Ok(false);
        };

        match event {
            Some(StreamEvent::Record(values)) => {
                match pulling.handler.on_record(&mut self.writer, values) {
                    Ok(_) => {
                        self.pulling = Some(pulling);
                        Ok(true)
                    }
                    Err(e) if !e.is_fatal() => {
                        // The result stays in the session until RESET drains it.
                        tracing::warn!(
                            "[{}] Cannot send record: {}",
                            self.session.remote_addr,
                            e
                        );
                        self.fail(
                            &mut pulling.handler,
                            Failure::from_status(Status::RequestInvalid, e.to_string()),
                        )?;
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Some(StreamEvent::Done(summary)) => {
                self.session.take_result();
                let metadata = self.summary(&pulling.handler, summary);
                self.session.set_state(pulling.next);
                self.respond_success(&mut pulling.handler, metadata)?;
                Ok(false)
            }
            Some(StreamEvent::Failed(e)) => {
                self.session.take_result();
                self.fail(&mut pulling.handler, Failure::new(e.code, e.message))?;
                Ok(false)
            }
            None => {
                self.session.take_result();
                self.fail(
                    &mut pulling.handler,
                    Failure::from_status(Status::UnknownError, "result stream ended unexpectedly"),
                )?;
                Ok(false)
            }
        }
    }

    /// Builds the terminal SUCCESS metadata of a PULL_ALL or DISCARD_ALL.
    fn summary(&self, handler: &ResponseHandler, mut summary: ValueMap) -> ValueMap {
        let v3 = self.session.version().uses_hello();
        if !v3 {
            summary.remove(BOOKMARK_KEY);
        }
        match handler.kind() {
            RequestKind::DiscardAll if !v3 => ValueMap::new(),
            RequestKind::DiscardAll => summary,
            _ => {
                if !summary.contains_key("type") {
                    summary.insert("type", "r");
                }
                summary.insert(self.timing_key(false), millis(handler.elapsed()));
                summary
            }
        }
    }

    fn timing_key(&self, first: bool) -> &'static str {
        match (self.session.version().uses_hello(), first) {
            (true, true) => "t_first",
            (true, false) => "t_last",
            (false, true) => "result_available_after",
            (false, false) => "result_consumed_after",
        }
    }

    /// Answers with FAILURE and moves to FAILED. Running work is cancelled;
    /// an open transaction survives until RESET.
    fn fail(&mut self, handler: &mut ResponseHandler, failure: Failure) -> Result<(), ServerError> {
        tracing::debug!(
            "[{}] {} failed: {}",
            self.session.remote_addr,
            handler.kind(),
            failure
        );
        self.session.cancel_execution();
        self.session.set_state(State::Failed);
        self.respond_failure(handler, failure)
    }

    fn respond_success(
        &mut self,
        handler: &mut ResponseHandler,
        metadata: ValueMap,
    ) -> Result<(), ServerError> {
        let delivery = handler.on_success(&mut self.writer, metadata)?;
        self.observe(handler, delivery, None);
        Ok(())
    }

    fn respond_failure(
        &mut self,
        handler: &mut ResponseHandler,
        failure: Failure,
    ) -> Result<(), ServerError> {
        let code = failure.code.clone();
        let delivery = handler.on_failure(&mut self.writer, failure)?;
        self.observe(handler, delivery, Some(code.as_str()));
        Ok(())
    }

    fn respond_ignored(&mut self, handler: &mut ResponseHandler) -> Result<(), ServerError> {
        let delivery = handler.on_ignored(&mut self.writer)?;
        self.observe(handler, delivery, None);
        Ok(())
    }

    fn observe(&self, handler: &ResponseHandler, delivery: Delivery, code: Option<&str>) {
        let Delivery::Sent(kind) = delivery else {
            return;
        };
        tracing::trace!(
            "[{}] S: {} for {} ({} records)",
            self.session.remote_addr,
            kind.name(),
            handler.kind(),
            handler.records()
        );

        let Some(metrics) = &self.ctx.metrics else {
            return;
        };
        let message = handler.kind().name();
        metrics
            .request_duration
            .with_label_values(&[message])
            .observe(handler.elapsed().as_secs_f64());
        match (kind, code) {
            (ResponseKind::Failure, Some(code)) => {
                metrics.failures_total.with_label_values(&[code]).inc();
            }
            (ResponseKind::Ignored, _) => {
                metrics.ignored_total.with_label_values(&[message]).inc();
            }
            _ => {}
        }
    }

    fn count_request(&self, message: &str) {
        if let Some(metrics) = &self.ctx.metrics {
            metrics.requests_total.with_label_values(&[message]).inc();
        }
    }

    fn release(&mut self) {
        self.session.cancel_execution();
        self.pulling = None;
        self.session.take_result();
        if let Some(tx) = self.session.take_tx() {
            if let Err(e) = self.ctx.engine.rollback(tx) {
                tracing::debug!(
                    "[{}] Rollback of {} on close: {}",
                    self.session.remote_addr,
                    tx,
                    e
                );
            } else {
                tracing::info!(
                    "[{}] Rolled back {} left open by the client",
                    self.session.remote_addr,
                    tx
                );
            }
        }
    }
}

async fn next_event(result: Option<&mut ResultStream>) -> Option<StreamEvent> {
    match result {
        Some(result) => result.next().await,
        None => std::future::pending().await,
    }
}

fn misrouted(request: &Request, action: Action) -> ServerError {
    ServerError::Protocol(ProtocolError::malformed(format!(
        "{} cannot perform {:?}",
        request.name(),
        action
    )))
}

fn millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenAuthenticator;
    use crate::config::NetworkConfig;
    use crate::engine::{EngineError, TxId};
    use crate::literal::LiteralEngine;
    use bytes::BytesMut;
    use graphwire_protocol::{Chunker, ProtocolVersion, TxMetadata, Unpacker};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    /// Accepts every RUN with a producer that holds a send permit forever,
    /// whatever the token says.
    struct StuckEngine;

    impl QueryEngine for StuckEngine {
        fn execute(
            &self,
            _query: Query,
            _tx: Option<TxId>,
            _cancel: CancellationToken,
        ) -> Result<ResultStream, EngineError> {
            let (sender, receiver) = mpsc::channel(1);
            tokio::spawn(async move {
                if let Ok(_permit) = sender.reserve().await {
                    std::future::pending::<()>().await;
                }
            });
            Ok(ResultStream::new(vec!["x".to_string()], receiver))
        }

        fn begin(&self, _metadata: &TxMetadata) -> Result<TxId, EngineError> {
            Err(EngineError::from_status(Status::UnknownError, "no transactions"))
        }

        fn commit(&self, tx: TxId) -> Result<String, EngineError> {
            Err(EngineError::from_status(Status::TransactionNotFound, tx.to_string()))
        }

        fn rollback(&self, tx: TxId) -> Result<(), EngineError> {
            Err(EngineError::from_status(Status::TransactionNotFound, tx.to_string()))
        }
    }

    struct Peer {
        stream: DuplexStream,
        registry: &'static MessageRegistry,
        dechunker: Dechunker,
        shutdown: broadcast::Sender<()>,
        task: JoinHandle<Result<(), ServerError>>,
    }

    fn context(engine: Arc<dyn QueryEngine>, reset_timeout: Duration) -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext {
            engine,
            authenticator: Arc::new(TokenAuthenticator::disabled()),
            metrics: None,
            server_agent: "graphwire/test".to_string(),
            idle_timeout: Duration::from_secs(30),
            reset_timeout,
        })
    }

    fn spawn(version: ProtocolVersion, engine: LiteralEngine) -> Peer {
        spawn_with(version, Arc::new(engine), Duration::from_secs(5))
    }

    fn spawn_with(
        version: ProtocolVersion,
        engine: Arc<dyn QueryEngine>,
        reset_timeout: Duration,
    ) -> Peer {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let pipeline = Pipeline::select(version, &NetworkConfig::default()).unwrap();
        let connection = Connection::new(
            server,
            "127.0.0.1:50000".parse().unwrap(),
            pipeline,
            context(engine, reset_timeout),
        );
        let (shutdown, mut rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { connection.run(&mut rx).await });
        Peer {
            stream: client,
            registry: MessageRegistry::for_version(version),
            dechunker: Dechunker::new(usize::MAX),
            shutdown,
            task,
        }
    }

    impl Peer {
        async fn send(&mut self, request: Request) {
            let mut body = BytesMut::new();
            self.registry.encode_request(&request, &mut body).unwrap();
            let framed = Chunker::default().to_bytes(&body);
            self.stream.write_all(&framed).await.unwrap();
        }

        /// Writes all requests with a single write so they are decoded together.
        async fn send_all(&mut self, requests: &[Request]) {
            let mut framed = BytesMut::new();
            for request in requests {
                let mut body = BytesMut::new();
                self.registry.encode_request(request, &mut body).unwrap();
                Chunker::default().encode(&body, &mut framed);
            }
            self.stream.write_all(&framed).await.unwrap();
        }

        async fn send_raw(&mut self, message: &[u8]) {
            let framed = Chunker::default().to_bytes(message);
            self.stream.write_all(&framed).await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            loop {
                if let Some(message) = self.dechunker.next_message().unwrap() {
                    let mut unpacker = Unpacker::new(&message, self.registry.version());
                    return Response::decode(&mut unpacker).unwrap();
                }
                let n = self
                    .stream
                    .read_buf(self.dechunker.buffer_mut())
                    .await
                    .unwrap();
                assert!(n > 0, "connection closed while waiting for a response");
            }
        }

        /// Skips records and returns the next other response.
        async fn recv_after_records(&mut self) -> Response {
            loop {
                match self.recv().await {
                    Response::Record(_) => continue,
                    other => return other,
                }
            }
        }

        async fn hello(&mut self) -> ValueMap {
            self.send(Request::hello("test/1.0", ValueMap::new())).await;
            match self.recv().await {
                Response::Success(meta) => meta,
                other => panic!("expected SUCCESS, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_hello_reports_server_and_connection_id() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        let meta = peer.hello().await;
        assert_eq!(
            meta.get("server").and_then(Value::as_str),
            Some("graphwire/test")
        );
        assert_eq!(
            meta.get("connection_id").and_then(Value::as_str).map(str::len),
            Some(36)
        );
    }

    #[tokio::test]
    async fn test_pipelined_requests_keep_order() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.hello().await;

        peer.send(Request::run("UNWIND range(1, 3) AS x RETURN x", ValueMap::new()))
            .await;
        peer.send(Request::PullAll).await;
        peer.send(Request::run("RETURN 'done' AS s", ValueMap::new()))
            .await;
        peer.send(Request::PullAll).await;

        assert!(matches!(peer.recv().await, Response::Success(_)));
        for i in 1..=3 {
            assert_eq!(peer.recv().await, Response::Record(vec![Value::Integer(i)]));
        }
        assert!(matches!(peer.recv().await, Response::Success(_)));
        match peer.recv().await {
            Response::Success(meta) => assert_eq!(
                meta.get("fields").and_then(Value::as_list),
                Some(&[Value::from("s")][..])
            ),
            other => panic!("expected SUCCESS, got {:?}", other),
        }
        assert_eq!(peer.recv().await, Response::Record(vec![Value::from("done")]));
        assert!(matches!(peer.recv().await, Response::Success(_)));
    }

    #[tokio::test]
    async fn test_failure_ignores_until_reset() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.hello().await;

        peer.send(Request::run("MATCH (n) RETURN n", ValueMap::new()))
            .await;
        match peer.recv().await {
            Response::Failure(f) => assert_eq!(f.code, Status::SyntaxError.code()),
            other => panic!("expected FAILURE, got {:?}", other),
        }

        peer.send(Request::PullAll).await;
        assert_eq!(peer.recv().await, Response::Ignored);
        peer.send(Request::run("RETURN 1", ValueMap::new())).await;
        assert_eq!(peer.recv().await, Response::Ignored);

        peer.send(Request::Reset).await;
        assert_eq!(peer.recv().await, Response::Success(ValueMap::new()));

        peer.send(Request::run("RETURN 1", ValueMap::new())).await;
        assert!(matches!(peer.recv().await, Response::Success(_)));
    }

    #[tokio::test]
    async fn test_unknown_signature_is_ignored_after_handshake() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.hello().await;
        peer.send_raw(&[0xB0, 0x99]).await;
        assert_eq!(peer.recv().await, Response::Ignored);

        peer.send(Request::run("RETURN 1", ValueMap::new())).await;
        assert!(matches!(peer.recv().await, Response::Success(_)));
    }

    #[tokio::test]
    async fn test_request_before_hello_closes() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.send(Request::run("RETURN 1", ValueMap::new())).await;

        let result = peer.task.await.unwrap();
        assert!(matches!(result, Err(ServerError::NotInitialized("RUN"))));
        let mut rest = Vec::new();
        peer.stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_goodbye_closes_silently() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.hello().await;
        peer.send(Request::Goodbye).await;
        assert!(peer.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_open_transaction_rolled_back_on_close() {
        let engine = LiteralEngine::new();
        let mut peer = spawn(ProtocolVersion::V3, engine.clone());
        peer.hello().await;
        peer.send(Request::Begin {
            metadata: Default::default(),
        })
        .await;
        assert_eq!(peer.recv().await, Response::Success(ValueMap::new()));
        assert_eq!(engine.open_transactions(), 1);

        drop(peer.stream);
        assert!(peer.task.await.unwrap().is_ok());
        assert_eq!(engine.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_connection() {
        let mut peer = spawn(ProtocolVersion::V1, LiteralEngine::new());
        peer.send(Request::init("test/1.0", ValueMap::new())).await;
        assert!(matches!(peer.recv().await, Response::Success(_)));

        peer.shutdown.send(()).unwrap();
        assert!(matches!(
            peer.task.await.unwrap(),
            Err(ServerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_reset_queued_behind_hello_ignores_work_in_between() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.send_all(&[
            Request::hello("test/1.0", ValueMap::new()),
            Request::run("RETURN 1 AS x", ValueMap::new()),
            Request::PullAll,
            Request::Reset,
        ])
        .await;

        assert!(matches!(peer.recv().await, Response::Success(_)));
        assert_eq!(peer.recv().await, Response::Ignored);
        assert_eq!(peer.recv().await, Response::Ignored);
        assert_eq!(peer.recv().await, Response::Success(ValueMap::new()));

        peer.send_all(&[Request::run("RETURN 1 AS x", ValueMap::new()), Request::PullAll])
            .await;
        assert!(matches!(peer.recv().await, Response::Success(_)));
        assert_eq!(peer.recv().await, Response::Record(vec![Value::Integer(1)]));
        assert!(matches!(peer.recv().await, Response::Success(_)));
    }

    #[tokio::test]
    async fn test_pipelined_resets_only_last_one_succeeds() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.hello().await;
        peer.send_all(&[
            Request::run("UNWIND range(1, 100000000) AS x RETURN x", ValueMap::new()),
            Request::PullAll,
        ])
        .await;
        assert!(matches!(peer.recv().await, Response::Success(_)));
        assert!(matches!(peer.recv().await, Response::Record(_)));

        peer.send_all(&[
            Request::Reset,
            Request::run("RETURN 1", ValueMap::new()),
            Request::Reset,
        ])
        .await;

        // The interrupted PULL_ALL, the first RESET, the RUN, the last RESET.
        assert_eq!(peer.recv_after_records().await, Response::Ignored);
        assert_eq!(peer.recv().await, Response::Ignored);
        assert_eq!(peer.recv().await, Response::Ignored);
        assert_eq!(peer.recv().await, Response::Success(ValueMap::new()));

        peer.send_all(&[Request::run("RETURN 'after'", ValueMap::new()), Request::PullAll])
            .await;
        assert!(matches!(peer.recv().await, Response::Success(_)));
        assert_eq!(peer.recv().await, Response::Record(vec![Value::from("after")]));
        assert!(matches!(peer.recv().await, Response::Success(_)));
    }

    #[tokio::test]
    async fn test_goodbye_stops_streaming_result() {
        let mut peer = spawn(ProtocolVersion::V3, LiteralEngine::new());
        peer.hello().await;
        peer.send_all(&[
            Request::run("UNWIND range(1, 100000000) AS x RETURN x", ValueMap::new()),
            Request::PullAll,
        ])
        .await;
        assert!(matches!(peer.recv().await, Response::Success(_)));
        assert!(matches!(peer.recv().await, Response::Record(_)));

        peer.send(Request::Goodbye).await;
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), peer.stream.read_to_end(&mut rest))
            .await
            .expect("connection kept streaming after GOODBYE")
            .unwrap();
        assert!(peer.task.await.unwrap().is_ok());

        peer.dechunker.extend(&rest);
        while let Some(message) = peer.dechunker.next_message().unwrap() {
            let mut unpacker = Unpacker::new(&message, ProtocolVersion::V3);
            let response = Response::decode(&mut unpacker).unwrap();
            assert!(matches!(response, Response::Record(_)), "got {:?}", response);
        }
    }

    #[tokio::test]
    async fn test_reset_gives_up_on_stuck_execution() {
        let mut peer = spawn_with(
            ProtocolVersion::V3,
            Arc::new(StuckEngine),
            Duration::from_millis(100),
        );
        peer.hello().await;
        peer.send(Request::run("RETURN 1", ValueMap::new())).await;
        assert!(matches!(peer.recv().await, Response::Success(_)));

        peer.send(Request::Reset).await;
        let result = peer.task.await.unwrap();
        assert!(matches!(result, Err(ServerError::ResetTimeout(_))));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reset_cleanup() {
        let mut peer = spawn_with(
            ProtocolVersion::V3,
            Arc::new(StuckEngine),
            Duration::from_secs(60),
        );
        peer.hello().await;
        peer.send(Request::run("RETURN 1", ValueMap::new())).await;
        assert!(matches!(peer.recv().await, Response::Success(_)));

        peer.send(Request::Reset).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.shutdown.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), peer.task)
            .await
            .expect("RESET cleanup ignored shutdown")
            .unwrap();
        assert!(matches!(result, Err(ServerError::ShuttingDown)));
    }
}
