//! Per-version message registries.
//!
//! A registry maps request signatures to decoders and response kinds to
//! encoders for one protocol version. Registries are built by layering the
//! v3 additions over the v1 base table, then shared immutably by every
//! connection of that version.

use crate::error::ProtocolError;
use crate::message::{signature, Request, RequestKind, Response, ResponseKind, TxMetadata};
use crate::packstream::{Packer, Unpacker};
use crate::value::{Value, ValueMap};
use crate::version::ProtocolVersion;
use bytes::BytesMut;
use std::sync::OnceLock;
use thiserror::Error;

/// How the outcome of a request is turned into responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// One SUCCESS or FAILURE.
    Summary,
    /// RECORDs followed by SUCCESS, or FAILURE.
    Stream,
    /// Records are consumed without being sent; then SUCCESS or FAILURE.
    Discard,
    /// Nothing is sent.
    Silent,
}

type BuildFn = fn(Vec<Value>) -> Result<Request, ProtocolError>;

/// Decoder for one request signature.
pub struct RequestDecoder {
    signature: u8,
    kind: RequestKind,
    fields: usize,
    reply: Reply,
    build: BuildFn,
}

impl RequestDecoder {
    fn new(kind: RequestKind, fields: usize, reply: Reply, build: BuildFn) -> Self {
        Self {
            signature: kind.signature(),
            kind,
            fields,
            reply,
            build,
        }
    }

    pub fn signature(&self) -> u8 {
        self.signature
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Number of fields the request structure carries.
    pub fn fields(&self) -> usize {
        self.fields
    }

    /// Reply strategy bound to the request.
    pub fn reply(&self) -> Reply {
        self.reply
    }

    /// Decodes the request body following a structure header that declared
    /// `fields` fields. The unpacker must be positioned after the header and
    /// is consumed to its end.
    pub fn decode(&self, unpacker: &mut Unpacker<'_>, fields: usize) -> Result<Request, ProtocolError> {
        if fields != self.fields {
            return Err(ProtocolError::StructureArity {
                signature: self.signature,
                expected: self.fields,
                actual: fields,
            });
        }
        let mut values = Vec::with_capacity(fields);
        for _ in 0..fields {
            values.push(unpacker.unpack()?);
        }
        unpacker.finish()?;
        (self.build)(values)
    }
}

impl std::fmt::Debug for RequestDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDecoder")
            .field("signature", &format_args!("{:#04x}", self.signature))
            .field("kind", &self.kind)
            .field("fields", &self.fields)
            .field("reply", &self.reply)
            .finish()
    }
}

/// Encoder for one response kind.
#[derive(Debug, Clone, Copy)]
pub struct ResponseEncoder {
    kind: ResponseKind,
    version: ProtocolVersion,
}

impl ResponseEncoder {
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn signature(&self) -> u8 {
        self.kind.signature()
    }

    /// Appends the packed response to `out`. On error `out` is left as it
    /// was.
    pub fn encode(&self, response: &Response, out: &mut BytesMut) -> Result<(), ProtocolError> {
        if response.kind() != self.kind {
            return Err(ProtocolError::UnsupportedValue(format!(
                "{} encoder given a {} response",
                self.kind.name(),
                response.kind().name()
            )));
        }
        let start = out.len();
        let result = response.encode(&mut Packer::new(out, self.version));
        if result.is_err() {
            out.truncate(start);
        }
        result
    }
}

/// Outcome of decoding a request message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The signature is not registered for the version. The message was
    /// framed correctly, so the stream is still in sync.
    #[error("unknown request signature {0:#04x}")]
    UnknownSignature(u8),

    /// A known request with field values that break its rules.
    #[error("invalid {kind} request: {reason}")]
    Invalid { kind: RequestKind, reason: String },

    /// Bytes that cannot be trusted; the connection must close.
    #[error(transparent)]
    Fatal(#[from] ProtocolError),
}

/// Request decoders and response encoders for one protocol version.
#[derive(Debug)]
pub struct MessageRegistry {
    version: ProtocolVersion,
    decoders: Vec<RequestDecoder>,
    encoders: [ResponseEncoder; 4],
}

impl MessageRegistry {
    /// Returns the shared registry for `version`.
    pub fn for_version(version: ProtocolVersion) -> &'static MessageRegistry {
        static V1: OnceLock<MessageRegistry> = OnceLock::new();
        static V2: OnceLock<MessageRegistry> = OnceLock::new();
        static V3: OnceLock<MessageRegistry> = OnceLock::new();

        let cell = match version {
            ProtocolVersion::V1 => &V1,
            ProtocolVersion::V2 => &V2,
            ProtocolVersion::V3 => &V3,
        };
        cell.get_or_init(|| MessageRegistry::build(version))
    }

    /// Builds a registry from the base table and the additions of every
    /// version up to `version`.
    pub fn build(version: ProtocolVersion) -> Self {
        let mut decoders = base_decoders();
        if version.uses_hello() {
            for addition in v3_decoders() {
                match decoders.iter_mut().find(|d| d.signature == addition.signature) {
                    Some(existing) => *existing = addition,
                    None => decoders.push(addition),
                }
            }
        }
        decoders.sort_by_key(|d| d.signature);

        let encoders = ResponseKind::ALL.map(|kind| ResponseEncoder { kind, version });

        Self {
            version,
            decoders,
            encoders,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn decoder_for(&self, signature: u8) -> Option<&RequestDecoder> {
        self.decoders.iter().find(|d| d.signature == signature)
    }

    /// Registered request signatures in ascending order.
    pub fn signatures(&self) -> impl Iterator<Item = u8> + '_ {
        self.decoders.iter().map(|d| d.signature)
    }

    pub fn encoder_for(&self, kind: ResponseKind) -> &ResponseEncoder {
        let index = ResponseKind::ALL
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_default();
        &self.encoders[index]
    }

    /// Decodes one complete (dechunked) request message.
    pub fn decode_request(&self, message: &[u8]) -> Result<(Request, Reply), DecodeError> {
        let mut unpacker = Unpacker::new(message, self.version);
        let (fields, sig) = unpacker.unpack_struct_header()?;
        let decoder = self
            .decoder_for(sig)
            .ok_or(DecodeError::UnknownSignature(sig))?;

        match decoder.decode(&mut unpacker, fields) {
            Ok(request) => Ok((request, decoder.reply)),
            Err(ProtocolError::InvalidRequest(reason)) => Err(DecodeError::Invalid {
                kind: decoder.kind,
                reason,
            }),
            Err(e) => Err(DecodeError::Fatal(e)),
        }
    }

    /// Packs a response body (unchunked) onto `out`.
    pub fn encode_response(&self, response: &Response, out: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encoder_for(response.kind()).encode(response, out)
    }

    /// Packs a request body as a client of this version would.
    pub fn encode_request(&self, request: &Request, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let registered = self
            .decoder_for(request.kind().signature())
            .is_some_and(|d| d.kind == request.kind());
        if !registered {
            return Err(ProtocolError::UnsupportedValue(format!(
                "{} is not part of protocol {}",
                request.name(),
                self.version
            )));
        }
        let start = out.len();
        let result = request.encode(&mut Packer::new(out, self.version));
        if result.is_err() {
            out.truncate(start);
        }
        result
    }
}

fn base_decoders() -> Vec<RequestDecoder> {
    vec![
        RequestDecoder::new(RequestKind::Init, 2, Reply::Summary, build_init),
        RequestDecoder::new(RequestKind::Run, 2, Reply::Summary, build_run),
        RequestDecoder::new(RequestKind::PullAll, 0, Reply::Stream, |_| Ok(Request::PullAll)),
        RequestDecoder::new(RequestKind::DiscardAll, 0, Reply::Discard, |_| {
            Ok(Request::DiscardAll)
        }),
        RequestDecoder::new(RequestKind::Reset, 0, Reply::Summary, |_| Ok(Request::Reset)),
    ]
}

fn v3_decoders() -> Vec<RequestDecoder> {
    vec![
        RequestDecoder::new(RequestKind::Hello, 1, Reply::Summary, build_hello),
        RequestDecoder::new(RequestKind::Run, 3, Reply::Summary, build_run_with_metadata),
        RequestDecoder::new(RequestKind::Begin, 1, Reply::Summary, build_begin),
        RequestDecoder::new(RequestKind::Commit, 0, Reply::Summary, |_| Ok(Request::Commit)),
        RequestDecoder::new(RequestKind::Rollback, 0, Reply::Summary, |_| {
            Ok(Request::Rollback)
        }),
        RequestDecoder::new(RequestKind::Goodbye, 0, Reply::Silent, |_| Ok(Request::Goodbye)),
    ]
}

/// Typed access to the fields of a request structure, in order.
struct Fields {
    kind: RequestKind,
    values: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(kind: RequestKind, values: Vec<Value>) -> Self {
        Self {
            kind,
            values: values.into_iter(),
        }
    }

    fn next(&mut self, what: &str) -> Result<Value, ProtocolError> {
        self.values
            .next()
            .ok_or_else(|| ProtocolError::malformed(format!("{} is missing {}", self.kind, what)))
    }

    fn string(&mut self, what: &str) -> Result<String, ProtocolError> {
        match self.next(what)? {
            Value::String(s) => Ok(s),
            other => Err(self.wrong_type(what, "String", &other)),
        }
    }

    fn map(&mut self, what: &str) -> Result<ValueMap, ProtocolError> {
        match self.next(what)? {
            Value::Map(map) => Ok(map),
            other => Err(self.wrong_type(what, "Map", &other)),
        }
    }

    fn wrong_type(&self, what: &str, expected: &str, found: &Value) -> ProtocolError {
        ProtocolError::malformed(format!(
            "{} {} must be a {}, found {}",
            self.kind,
            what,
            expected,
            found.type_name()
        ))
    }
}

fn require_primitive(map: &ValueMap, what: &str) -> Result<(), ProtocolError> {
    match map.iter().find(|(_, v)| !v.is_primitive()) {
        Some((key, value)) => Err(ProtocolError::invalid_request(format!(
            "{} entry '{}' holds a {}; only primitive values are allowed",
            what,
            key,
            value.type_name()
        ))),
        None => Ok(()),
    }
}

fn build_init(values: Vec<Value>) -> Result<Request, ProtocolError> {
    let mut fields = Fields::new(RequestKind::Init, values);
    let user_agent = fields.string("user agent")?;
    let auth = fields.map("auth token")?;
    require_primitive(&auth, "auth token")?;
    Ok(Request::Init { user_agent, auth })
}

fn build_hello(values: Vec<Value>) -> Result<Request, ProtocolError> {
    let mut fields = Fields::new(RequestKind::Hello, values);
    let extra = fields.map("extra")?;
    require_primitive(&extra, "HELLO")?;
    match extra.get(Request::USER_AGENT) {
        Some(Value::String(_)) => Ok(Request::Hello { extra }),
        Some(other) => Err(ProtocolError::invalid_request(format!(
            "user_agent must be a string, got {}",
            other.type_name()
        ))),
        None => Err(ProtocolError::invalid_request("HELLO requires a user_agent")),
    }
}

fn build_run(values: Vec<Value>) -> Result<Request, ProtocolError> {
    let mut fields = Fields::new(RequestKind::Run, values);
    Ok(Request::Run {
        statement: fields.string("statement")?,
        parameters: fields.map("parameters")?,
        metadata: TxMetadata::default(),
    })
}

fn build_run_with_metadata(values: Vec<Value>) -> Result<Request, ProtocolError> {
    let mut fields = Fields::new(RequestKind::Run, values);
    let statement = fields.string("statement")?;
    let parameters = fields.map("parameters")?;
    let metadata = TxMetadata::parse(&fields.map("metadata")?)?;
    Ok(Request::Run {
        statement,
        parameters,
        metadata,
    })
}

fn build_begin(values: Vec<Value>) -> Result<Request, ProtocolError> {
    let mut fields = Fields::new(RequestKind::Begin, values);
    let metadata = TxMetadata::parse(&fields.map("metadata")?)?;
    Ok(Request::Begin { metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packstream::marker;
    use std::time::Duration;

    fn encode(version: ProtocolVersion, request: &Request) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageRegistry::for_version(version)
            .encode_request(request, &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_v1_signatures() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V1);
        let signatures: Vec<u8> = registry.signatures().collect();
        assert_eq!(
            signatures,
            vec![
                signature::INIT,
                signature::RESET,
                signature::RUN,
                signature::DISCARD_ALL,
                signature::PULL_ALL
            ]
        );
        assert!(registry.decoder_for(signature::BEGIN).is_none());
        assert!(registry.decoder_for(signature::GOODBYE).is_none());
    }

    #[test]
    fn test_v2_matches_v1_messages() {
        let v1: Vec<u8> = MessageRegistry::for_version(ProtocolVersion::V1)
            .signatures()
            .collect();
        let v2: Vec<u8> = MessageRegistry::for_version(ProtocolVersion::V2)
            .signatures()
            .collect();
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_v3_layers_over_base() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V3);
        assert_eq!(
            registry.decoder_for(signature::HELLO).unwrap().kind(),
            RequestKind::Hello
        );
        assert_eq!(registry.decoder_for(signature::RUN).unwrap().fields(), 3);
        for sig in [
            signature::BEGIN,
            signature::COMMIT,
            signature::ROLLBACK,
            signature::GOODBYE,
            signature::PULL_ALL,
            signature::RESET,
        ] {
            assert!(registry.decoder_for(sig).is_some(), "{:#04x}", sig);
        }
        assert_eq!(
            registry.decoder_for(signature::GOODBYE).unwrap().reply(),
            Reply::Silent
        );
        assert_eq!(
            registry.decoder_for(signature::PULL_ALL).unwrap().reply(),
            Reply::Stream
        );
    }

    #[test]
    fn test_registry_is_shared() {
        let a = MessageRegistry::for_version(ProtocolVersion::V3);
        let b = MessageRegistry::for_version(ProtocolVersion::V3);
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_decode_v1_init_and_run() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V1);
        let init = Request::init("driver/1.0", ValueMap::new().with("scheme", "none"));
        let (decoded, reply) = registry
            .decode_request(&encode(ProtocolVersion::V1, &init))
            .unwrap();
        assert_eq!(decoded, init);
        assert_eq!(reply, Reply::Summary);

        let run = Request::run("RETURN $x", ValueMap::new().with("x", 1));
        let (decoded, _) = registry
            .decode_request(&encode(ProtocolVersion::V1, &run))
            .unwrap();
        assert_eq!(decoded, run);
    }

    #[test]
    fn test_v3_decodes_everything_a_v1_client_sends_except_handshake() {
        let v3 = MessageRegistry::for_version(ProtocolVersion::V3);
        for request in [Request::PullAll, Request::DiscardAll, Request::Reset] {
            let bytes = encode(ProtocolVersion::V1, &request);
            let (decoded, _) = v3.decode_request(&bytes).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_decode_run_with_metadata() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V3);
        let meta = TxMetadata {
            bookmarks: vec![],
            tx_timeout: Some(Duration::from_millis(250)),
            tx_metadata: ValueMap::new().with("app", "tests"),
        };
        let run = Request::run("RETURN 1", ValueMap::new()).with_metadata(meta.clone());
        let (decoded, _) = registry
            .decode_request(&encode(ProtocolVersion::V3, &run))
            .unwrap();
        match decoded {
            Request::Run { metadata, .. } => assert_eq!(metadata, meta),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_signature_is_not_fatal() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V3);
        let result = registry.decode_request(&[0xB0, 0x99]);
        assert!(matches!(result, Err(DecodeError::UnknownSignature(0x99))));

        // BEGIN does not exist before v3.
        let begin = encode(ProtocolVersion::V3, &Request::Begin {
            metadata: TxMetadata::default(),
        });
        let result = MessageRegistry::for_version(ProtocolVersion::V1).decode_request(&begin);
        assert!(matches!(
            result,
            Err(DecodeError::UnknownSignature(signature::BEGIN))
        ));
    }

    #[test]
    fn test_invalid_metadata_is_request_invalid() {
        // RUN "x" {} {tx_timeout: "soon"}
        let mut buf = BytesMut::new();
        let mut packer = Packer::new(&mut buf, ProtocolVersion::V3);
        packer.pack_struct_header(3, signature::RUN).unwrap();
        packer.pack_string("x").unwrap();
        packer.pack_map(&ValueMap::new()).unwrap();
        packer
            .pack_map(&ValueMap::new().with("tx_timeout", "soon"))
            .unwrap();

        let result = MessageRegistry::for_version(ProtocolVersion::V3).decode_request(&buf);
        assert!(matches!(
            result,
            Err(DecodeError::Invalid {
                kind: RequestKind::Run,
                ..
            })
        ));
    }

    #[test]
    fn test_hello_requires_user_agent() {
        let mut buf = BytesMut::new();
        let mut packer = Packer::new(&mut buf, ProtocolVersion::V3);
        packer.pack_struct_header(1, signature::HELLO).unwrap();
        packer
            .pack_map(&ValueMap::new().with("scheme", "none"))
            .unwrap();
        let result = MessageRegistry::for_version(ProtocolVersion::V3).decode_request(&buf);
        assert!(matches!(result, Err(DecodeError::Invalid { .. })));
    }

    #[test]
    fn test_auth_token_with_bytes_is_rejected() {
        let mut buf = BytesMut::new();
        let mut packer = Packer::new(&mut buf, ProtocolVersion::V2);
        packer.pack_struct_header(2, signature::INIT).unwrap();
        packer.pack_string("driver").unwrap();
        packer.pack_map_header(1).unwrap();
        packer.pack_string("credentials").unwrap();
        packer.pack_bytes(b"secret").unwrap();
        let result = MessageRegistry::for_version(ProtocolVersion::V2).decode_request(&buf);
        assert!(matches!(result, Err(DecodeError::Invalid { .. })));
    }

    #[test]
    fn test_fatal_decode_errors() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V3);

        // PULL_ALL with a field
        assert!(matches!(
            registry.decode_request(&[0xB1, 0x3F, 0x01]),
            Err(DecodeError::Fatal(ProtocolError::StructureArity { .. }))
        ));
        // RUN whose statement is an integer
        assert!(matches!(
            registry.decode_request(&[0xB3, 0x10, 0x01, 0xA0, 0xA0]),
            Err(DecodeError::Fatal(ProtocolError::MalformedMessage(_)))
        ));
        // Not a structure
        assert!(matches!(
            registry.decode_request(&[marker::NULL]),
            Err(DecodeError::Fatal(_))
        ));
        // Trailing garbage
        assert!(matches!(
            registry.decode_request(&[0xB0, 0x0F, 0x00]),
            Err(DecodeError::Fatal(_))
        ));
        // Truncated
        assert!(matches!(
            registry.decode_request(&[0xB1]),
            Err(DecodeError::Fatal(ProtocolError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_encode_request_checks_version() {
        let mut buf = BytesMut::new();
        let result = MessageRegistry::for_version(ProtocolVersion::V1)
            .encode_request(&Request::Commit, &mut buf);
        assert!(result.is_err());
        assert!(buf.is_empty());

        let hello = Request::hello("d", ValueMap::new());
        assert!(MessageRegistry::for_version(ProtocolVersion::V2)
            .encode_request(&hello, &mut buf)
            .is_err());
    }

    #[test]
    fn test_encode_response_leaves_buffer_untouched_on_error() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V1);
        let mut buf = BytesMut::from(&b"keep"[..]);
        let record = Response::Record(vec![Value::from(1), Value::Bytes(bytes::Bytes::from_static(b"x"))]);
        assert!(registry.encode_response(&record, &mut buf).is_err());
        assert_eq!(&buf[..], b"keep");

        registry
            .encode_response(&Response::Ignored, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[b'k', b'e', b'e', b'p', 0xB0, 0x7E]);
    }

    #[test]
    fn test_encoder_for_kind() {
        let registry = MessageRegistry::for_version(ProtocolVersion::V2);
        for kind in ResponseKind::ALL {
            let encoder = registry.encoder_for(kind);
            assert_eq!(encoder.kind(), kind);
            assert_eq!(encoder.signature(), kind.signature());
        }
        let mut buf = BytesMut::new();
        assert!(registry
            .encoder_for(ResponseKind::Success)
            .encode(&Response::Ignored, &mut buf)
            .is_err());
    }
}
