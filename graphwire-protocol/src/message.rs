//! Request and response messages.
//!
//! Every message is a structure whose signature names the message type. The
//! request decoders live in [`crate::registry`]; this module holds the typed
//! messages, their metadata rules, and the (version-independent) response
//! layouts.

use crate::error::{ProtocolError, Status};
use crate::packstream::{Packer, Unpacker};
use crate::value::{Value, ValueMap};
use std::fmt;
use std::time::Duration;

/// Message signatures.
pub mod signature {
    // Requests
    pub const INIT: u8 = 0x01;
    pub const HELLO: u8 = 0x01;
    pub const GOODBYE: u8 = 0x02;
    pub const RESET: u8 = 0x0F;
    pub const RUN: u8 = 0x10;
    pub const BEGIN: u8 = 0x11;
    pub const COMMIT: u8 = 0x12;
    pub const ROLLBACK: u8 = 0x13;
    pub const DISCARD_ALL: u8 = 0x2F;
    pub const PULL_ALL: u8 = 0x3F;

    // Responses
    pub const SUCCESS: u8 = 0x70;
    pub const RECORD: u8 = 0x71;
    pub const IGNORED: u8 = 0x7E;
    pub const FAILURE: u8 = 0x7F;
}

/// Request types, without their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Init,
    Hello,
    Run,
    PullAll,
    DiscardAll,
    Reset,
    Begin,
    Commit,
    Rollback,
    Goodbye,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Init => "INIT",
            RequestKind::Hello => "HELLO",
            RequestKind::Run => "RUN",
            RequestKind::PullAll => "PULL_ALL",
            RequestKind::DiscardAll => "DISCARD_ALL",
            RequestKind::Reset => "RESET",
            RequestKind::Begin => "BEGIN",
            RequestKind::Commit => "COMMIT",
            RequestKind::Rollback => "ROLLBACK",
            RequestKind::Goodbye => "GOODBYE",
        }
    }

    pub fn signature(self) -> u8 {
        match self {
            RequestKind::Init => signature::INIT,
            RequestKind::Hello => signature::HELLO,
            RequestKind::Run => signature::RUN,
            RequestKind::PullAll => signature::PULL_ALL,
            RequestKind::DiscardAll => signature::DISCARD_ALL,
            RequestKind::Reset => signature::RESET,
            RequestKind::Begin => signature::BEGIN,
            RequestKind::Commit => signature::COMMIT,
            RequestKind::Rollback => signature::ROLLBACK,
            RequestKind::Goodbye => signature::GOODBYE,
        }
    }

    /// INIT or HELLO.
    pub fn is_handshake(self) -> bool {
        matches!(self, RequestKind::Init | RequestKind::Hello)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transaction options carried by BEGIN, and by RUN outside a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxMetadata {
    /// Bookmarks the transaction must observe.
    pub bookmarks: Vec<String>,
    /// `None` means no timeout.
    pub tx_timeout: Option<Duration>,
    /// Primitive-only key/value pairs attached to the transaction.
    pub tx_metadata: ValueMap,
}

impl TxMetadata {
    pub const BOOKMARKS: &'static str = "bookmarks";
    pub const TX_TIMEOUT: &'static str = "tx_timeout";
    pub const TX_METADATA: &'static str = "tx_metadata";

    /// Parses the metadata map of RUN or BEGIN.
    ///
    /// Absent keys take their defaults; unknown keys are ignored. A present
    /// key with the wrong shape is an [`ProtocolError::InvalidRequest`].
    pub fn parse(map: &ValueMap) -> Result<Self, ProtocolError> {
        let mut meta = TxMetadata::default();

        match map.get(Self::TX_TIMEOUT) {
            None | Some(Value::Null) => {}
            Some(Value::Integer(ms)) if *ms >= 0 => {
                meta.tx_timeout = Some(Duration::from_millis(*ms as u64));
            }
            Some(Value::Integer(ms)) => {
                return Err(ProtocolError::invalid_request(format!(
                    "tx_timeout must not be negative, got {}",
                    ms
                )))
            }
            Some(other) => {
                return Err(ProtocolError::invalid_request(format!(
                    "tx_timeout must be an integer, got {}",
                    other.type_name()
                )))
            }
        }

        match map.get(Self::TX_METADATA) {
            None | Some(Value::Null) => {}
            Some(Value::Map(entries)) => {
                if let Some((key, value)) = entries.iter().find(|(_, v)| !v.is_primitive()) {
                    return Err(ProtocolError::invalid_request(format!(
                        "tx_metadata entry '{}' holds a {}; only primitive values are allowed",
                        key,
                        value.type_name()
                    )));
                }
                meta.tx_metadata = entries.clone();
            }
            Some(other) => {
                return Err(ProtocolError::invalid_request(format!(
                    "tx_metadata must be a map, got {}",
                    other.type_name()
                )))
            }
        }

        match map.get(Self::BOOKMARKS) {
            None | Some(Value::Null) => {}
            Some(Value::List(items)) => {
                meta.bookmarks = items
                    .iter()
                    .map(|item| {
                        item.as_str().map(str::to_string).ok_or_else(|| {
                            ProtocolError::invalid_request("bookmarks must be a list of strings")
                        })
                    })
                    .collect::<Result<_, _>>()?;
            }
            Some(other) => {
                return Err(ProtocolError::invalid_request(format!(
                    "bookmarks must be a list, got {}",
                    other.type_name()
                )))
            }
        }

        Ok(meta)
    }

    /// Builds the wire map, leaving out defaults.
    pub fn to_map(&self) -> ValueMap {
        let mut map = ValueMap::new();
        if !self.bookmarks.is_empty() {
            let bookmarks: Vec<Value> = self.bookmarks.iter().map(|b| Value::from(b.as_str())).collect();
            map.insert(Self::BOOKMARKS, bookmarks);
        }
        if let Some(timeout) = self.tx_timeout {
            map.insert(Self::TX_TIMEOUT, timeout.as_millis().min(i64::MAX as u128) as i64);
        }
        if !self.tx_metadata.is_empty() {
            map.insert(Self::TX_METADATA, self.tx_metadata.clone());
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty() && self.tx_timeout.is_none() && self.tx_metadata.is_empty()
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// v1/v2 connection initialisation.
    Init { user_agent: String, auth: ValueMap },
    /// v3 connection initialisation; `extra` holds the user agent and the
    /// auth token entries.
    Hello { extra: ValueMap },
    Run {
        statement: String,
        parameters: ValueMap,
        metadata: TxMetadata,
    },
    PullAll,
    DiscardAll,
    Reset,
    Begin { metadata: TxMetadata },
    Commit,
    Rollback,
    Goodbye,
}

impl Request {
    pub const USER_AGENT: &'static str = "user_agent";

    pub fn init(user_agent: impl Into<String>, auth: ValueMap) -> Self {
        Request::Init {
            user_agent: user_agent.into(),
            auth,
        }
    }

    pub fn hello(user_agent: impl Into<String>, auth: ValueMap) -> Self {
        let mut extra = ValueMap::with_capacity(auth.len() + 1);
        extra.insert(Self::USER_AGENT, user_agent.into());
        for (key, value) in auth {
            extra.insert(key, value);
        }
        Request::Hello { extra }
    }

    pub fn run(statement: impl Into<String>, parameters: ValueMap) -> Self {
        Request::Run {
            statement: statement.into(),
            parameters,
            metadata: TxMetadata::default(),
        }
    }

    /// Replaces the metadata of a RUN or BEGIN request.
    pub fn with_metadata(mut self, meta: TxMetadata) -> Self {
        match &mut self {
            Request::Run { metadata, .. } | Request::Begin { metadata } => *metadata = meta,
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Init { .. } => RequestKind::Init,
            Request::Hello { .. } => RequestKind::Hello,
            Request::Run { .. } => RequestKind::Run,
            Request::PullAll => RequestKind::PullAll,
            Request::DiscardAll => RequestKind::DiscardAll,
            Request::Reset => RequestKind::Reset,
            Request::Begin { .. } => RequestKind::Begin,
            Request::Commit => RequestKind::Commit,
            Request::Rollback => RequestKind::Rollback,
            Request::Goodbye => RequestKind::Goodbye,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// The client's user agent, for INIT and HELLO.
    pub fn user_agent(&self) -> Option<&str> {
        match self {
            Request::Init { user_agent, .. } => Some(user_agent),
            Request::Hello { extra } => extra.get(Self::USER_AGENT).and_then(Value::as_str),
            _ => None,
        }
    }

    /// The auth token map, for INIT and HELLO.
    pub fn auth_token(&self) -> Option<ValueMap> {
        match self {
            Request::Init { auth, .. } => Some(auth.clone()),
            Request::Hello { extra } => Some(
                extra
                    .iter()
                    .filter(|(k, _)| *k != Self::USER_AGENT)
                    .map(|(k, v)| (k, v.clone()))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Packs the request the way a client of `packer`'s version sends it.
    pub fn encode(&self, packer: &mut Packer<'_>) -> Result<(), ProtocolError> {
        let v3 = packer.version().uses_hello();
        match self {
            Request::Init { user_agent, auth } => {
                packer.pack_struct_header(2, signature::INIT)?;
                packer.pack_string(user_agent)?;
                packer.pack_primitive_map(auth)?;
            }
            Request::Hello { extra } => {
                packer.pack_struct_header(1, signature::HELLO)?;
                packer.pack_primitive_map(extra)?;
            }
            Request::Run {
                statement,
                parameters,
                metadata,
            } => {
                packer.pack_struct_header(if v3 { 3 } else { 2 }, signature::RUN)?;
                packer.pack_string(statement)?;
                packer.pack_map(parameters)?;
                if v3 {
                    packer.pack_primitive_map(&metadata.to_map())?;
                }
            }
            Request::Begin { metadata } => {
                packer.pack_struct_header(1, signature::BEGIN)?;
                packer.pack_primitive_map(&metadata.to_map())?;
            }
            Request::PullAll
            | Request::DiscardAll
            | Request::Reset
            | Request::Commit
            | Request::Rollback
            | Request::Goodbye => {
                packer.pack_struct_header(0, self.kind().signature())?;
            }
        }
        Ok(())
    }
}

/// Response types, without their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Success,
    Record,
    Ignored,
    Failure,
}

impl ResponseKind {
    pub const ALL: [ResponseKind; 4] = [
        ResponseKind::Success,
        ResponseKind::Record,
        ResponseKind::Ignored,
        ResponseKind::Failure,
    ];

    pub fn signature(self) -> u8 {
        match self {
            ResponseKind::Success => signature::SUCCESS,
            ResponseKind::Record => signature::RECORD,
            ResponseKind::Ignored => signature::IGNORED,
            ResponseKind::Failure => signature::FAILURE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ResponseKind::Success => "SUCCESS",
            ResponseKind::Record => "RECORD",
            ResponseKind::Ignored => "IGNORED",
            ResponseKind::Failure => "FAILURE",
        }
    }
}

/// Status code and message of a FAILURE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn from_status(status: Status, message: impl Into<String>) -> Self {
        Self::new(status.code(), message)
    }

    fn to_map(&self) -> ValueMap {
        ValueMap::new()
            .with("code", self.code.as_str())
            .with("message", self.message.as_str())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(ValueMap),
    Record(Vec<Value>),
    Ignored,
    Failure(Failure),
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::Success(_) => ResponseKind::Success,
            Response::Record(_) => ResponseKind::Record,
            Response::Ignored => ResponseKind::Ignored,
            Response::Failure(_) => ResponseKind::Failure,
        }
    }

    pub fn failure(status: Status, message: impl Into<String>) -> Self {
        Response::Failure(Failure::from_status(status, message))
    }

    /// Packs the response. Metadata maps may only carry primitive values;
    /// record fields may carry anything the version supports.
    pub fn encode(&self, packer: &mut Packer<'_>) -> Result<(), ProtocolError> {
        let kind = self.kind();
        match self {
            Response::Success(metadata) => {
                packer.pack_struct_header(1, kind.signature())?;
                packer.pack_primitive_map(metadata)?;
            }
            Response::Record(fields) => {
                packer.pack_struct_header(1, kind.signature())?;
                packer.pack_list_header(fields.len())?;
                for field in fields {
                    packer.pack(field)?;
                }
            }
            Response::Ignored => {
                packer.pack_struct_header(0, kind.signature())?;
            }
            Response::Failure(failure) => {
                packer.pack_struct_header(1, kind.signature())?;
                packer.pack_primitive_map(&failure.to_map())?;
            }
        }
        Ok(())
    }

    /// Unpacks one response, as a client does.
    pub fn decode(unpacker: &mut Unpacker<'_>) -> Result<Self, ProtocolError> {
        let (fields, sig) = unpacker.unpack_struct_header()?;
        let (response, expected) = match sig {
            signature::SUCCESS => (Response::Success(unpacker.unpack_map()?), 1),
            signature::RECORD => (Response::Record(unpacker.unpack_list()?), 1),
            signature::IGNORED => (Response::Ignored, 0),
            signature::FAILURE => {
                let map = unpacker.unpack_map()?;
                let text = |key: &str| {
                    map.get(key)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| ProtocolError::malformed(format!("FAILURE without {}", key)))
                };
                (Response::Failure(Failure::new(text("code")?, text("message")?)), 1)
            }
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unknown response signature {:#04x}",
                    other
                )))
            }
        };
        if fields != expected {
            return Err(ProtocolError::StructureArity {
                signature: sig,
                expected,
                actual: fields,
            });
        }
        Ok(response)
    }
}
