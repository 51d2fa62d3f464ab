//! Per-connection session state.
//!
//! A session is owned by its connection task and never shared, so nothing
//! here needs synchronisation.

use crate::auth::Principal;
use crate::engine::{ResultStream, TxId};
use crate::state::State;
use graphwire_protocol::ProtocolVersion;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A client session.
pub struct Session {
    /// Unique session ID, reported to v3 clients as `connection_id`.
    pub id: String,

    pub remote_addr: SocketAddr,

    /// Negotiated during the handshake and fixed afterwards.
    version: ProtocolVersion,

    state: State,

    principal: Option<Principal>,

    user_agent: Option<String>,

    /// RESETs received but not yet processed.
    interrupts: u32,

    /// Open explicit transaction.
    tx: Option<TxId>,

    /// Result of the last RUN, until it is pulled, discarded or reset.
    result: Option<ResultStream>,

    /// Cancels the execution behind `result`.
    cancel: CancellationToken,

    request_count: u64,

    created_at: Instant,

    last_activity: Instant,
}

impl Session {
    pub fn new(remote_addr: SocketAddr, version: ProtocolVersion) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            version,
            state: State::Connected,
            principal: None,
            user_agent: None,
            interrupts: 0,
            tx: None,
            result: None,
            cancel: CancellationToken::new(),
            request_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        if state != self.state {
            tracing::trace!("[{}] {} -> {}", self.remote_addr, self.state, state);
        }
        self.state = state;
    }

    /// Completes INIT/HELLO.
    pub fn authenticate(&mut self, principal: Principal, user_agent: Option<String>) {
        self.principal = Some(principal);
        self.user_agent = user_agent;
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Registers an incoming RESET: cancels in-flight work and marks the
    /// session interrupted. Returns the number of pending RESETs.
    ///
    /// Before INIT/HELLO nothing can be running, so only the count changes
    /// and the token stays usable for the first RUN.
    pub fn interrupt(&mut self) -> u32 {
        self.interrupts += 1;
        if self.state != State::Connected {
            self.cancel.cancel();
            self.set_state(State::Interrupted);
        }
        self.interrupts
    }

    /// Consumes one pending RESET. Returns how many are still queued.
    pub fn acknowledge_interrupt(&mut self) -> u32 {
        self.interrupts = self.interrupts.saturating_sub(1);
        self.interrupts
    }

    pub fn pending_interrupts(&self) -> u32 {
        self.interrupts
    }

    /// Token for a new execution.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replaces a fired token once cleanup has finished.
    pub fn renew_cancel_token(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    pub fn cancel_execution(&self) {
        self.cancel.cancel();
    }

    pub fn tx(&self) -> Option<TxId> {
        self.tx
    }

    pub fn set_tx(&mut self, tx: Option<TxId>) {
        self.tx = tx;
    }

    pub fn take_tx(&mut self) -> Option<TxId> {
        self.tx.take()
    }

    pub fn set_result(&mut self, result: ResultStream) {
        self.result = Some(result);
    }

    pub fn result_mut(&mut self) -> Option<&mut ResultStream> {
        self.result.as_mut()
    }

    pub fn take_result(&mut self) -> Option<ResultStream> {
        self.result.take()
    }

    /// Counts a decoded request and marks the session active.
    pub fn record_request(&mut self) {
        self.request_count += 1;
        self.touch();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
