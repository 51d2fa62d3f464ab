//! Connection state machine.
//!
//! The machine is a pure function of `(state, request kind)`. Each protocol
//! version gets a [`StateGraph`] composed from a base table and, from v3 on,
//! the explicit-transaction additions, so a v1 connection can never reach
//! a transaction state.
//!
//! ```text
//! CONNECTED --INIT/HELLO--> READY --RUN--> STREAMING --PULL/DISCARD--> READY
//!                           READY --BEGIN--> TX_READY --RUN--> TX_STREAMING
//!                        TX_READY <--PULL/DISCARD-- TX_STREAMING
//!                        TX_READY --COMMIT/ROLLBACK--> READY
//! any --failure--> FAILED,  any --RESET arrives--> INTERRUPTED --RESET--> READY
//! ```

use graphwire_protocol::{ProtocolVersion, RequestKind};
use std::fmt;
use std::sync::OnceLock;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Connected,
    Ready,
    Streaming,
    TxReady,
    TxStreaming,
    Failed,
    Interrupted,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Connected,
        State::Ready,
        State::Streaming,
        State::TxReady,
        State::TxStreaming,
        State::Failed,
        State::Interrupted,
    ];

    pub fn name(self) -> &'static str {
        match self {
            State::Connected => "CONNECTED",
            State::Ready => "READY",
            State::Streaming => "STREAMING",
            State::TxReady => "TX_READY",
            State::TxStreaming => "TX_STREAMING",
            State::Failed => "FAILED",
            State::Interrupted => "INTERRUPTED",
        }
    }

    /// Whether a RUN result is waiting for PULL_ALL or DISCARD_ALL.
    pub fn is_streaming(self) -> bool {
        matches!(self, State::Streaming | State::TxStreaming)
    }

    /// Whether an explicit transaction is open.
    pub fn in_transaction(self) -> bool {
        matches!(self, State::TxReady | State::TxStreaming)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work the connection performs for an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Authenticate,
    Run,
    Pull,
    Discard,
    Begin,
    Commit,
    Rollback,
    Reset,
}

/// What to do with a request in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Perform `action`; on success move to `next`, on failure to FAILED.
    Accept { action: Action, next: State },
    /// Answer IGNORED and keep the state.
    Ignore,
    /// Close without a response (GOODBYE).
    Close,
    /// Protocol violation that ends the connection.
    Fatal,
}

type Transition = (State, RequestKind, Action, State);

const BASE: &[Transition] = &[
    (State::Ready, RequestKind::Run, Action::Run, State::Streaming),
    (State::Streaming, RequestKind::PullAll, Action::Pull, State::Ready),
    (State::Streaming, RequestKind::DiscardAll, Action::Discard, State::Ready),
];

const TRANSACTIONS: &[Transition] = &[
    (State::Ready, RequestKind::Begin, Action::Begin, State::TxReady),
    (State::TxReady, RequestKind::Run, Action::Run, State::TxStreaming),
    (State::TxReady, RequestKind::Commit, Action::Commit, State::Ready),
    (State::TxReady, RequestKind::Rollback, Action::Rollback, State::Ready),
    (State::TxStreaming, RequestKind::PullAll, Action::Pull, State::TxReady),
    (State::TxStreaming, RequestKind::DiscardAll, Action::Discard, State::TxReady),
];

/// The legal transitions of one protocol version. Immutable and shared.
#[derive(Debug)]
pub struct StateGraph {
    version: ProtocolVersion,
    transitions: Vec<Transition>,
}

impl StateGraph {
    /// Returns the shared graph for `version`.
    pub fn for_version(version: ProtocolVersion) -> &'static StateGraph {
        static V1: OnceLock<StateGraph> = OnceLock::new();
        static V2: OnceLock<StateGraph> = OnceLock::new();
        static V3: OnceLock<StateGraph> = OnceLock::new();

        let cell = match version {
            ProtocolVersion::V1 => &V1,
            ProtocolVersion::V2 => &V2,
            ProtocolVersion::V3 => &V3,
        };
        cell.get_or_init(|| StateGraph::build(version))
    }

    pub fn build(version: ProtocolVersion) -> Self {
        let mut transitions = BASE.to_vec();
        if version.supports_transactions() {
            transitions.extend_from_slice(TRANSACTIONS);
        }
        Self {
            version,
            transitions,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// States a connection can be in under this graph.
    pub fn reachable_states(&self) -> Vec<State> {
        State::ALL
            .into_iter()
            .filter(|s| {
                !s.in_transaction() || self.transitions.iter().any(|(_, _, _, next)| next == s)
            })
            .collect()
    }

    /// Decides how to treat a request of `kind` arriving in `state`.
    pub fn decide(&self, state: State, kind: RequestKind) -> Decision {
        if kind == RequestKind::Goodbye {
            return Decision::Close;
        }

        match state {
            State::Connected if kind.is_handshake() => Decision::Accept {
                action: Action::Authenticate,
                next: State::Ready,
            },
            State::Connected => Decision::Fatal,
            _ if kind.is_handshake() => Decision::Ignore,
            _ if kind == RequestKind::Reset => Decision::Accept {
                action: Action::Reset,
                next: State::Ready,
            },
            State::Failed | State::Interrupted => Decision::Ignore,
            _ => self
                .transitions
                .iter()
                .find(|(from, k, _, _)| *from == state && *k == kind)
                .map_or(Decision::Ignore, |&(_, _, action, next)| Decision::Accept {
                    action,
                    next,
                }),
        }
    }
}
