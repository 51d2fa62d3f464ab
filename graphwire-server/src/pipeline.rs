//! Per-version protocol pipeline.
//!
//! Once a version is agreed, everything a connection needs to speak it is
//! selected in one place: the shared message registry (which carries the
//! value codec variant), the shared state graph, and fresh framing state.

use crate::config::NetworkConfig;
use crate::state::StateGraph;
use graphwire_protocol::{
    Chunker, Dechunker, Handshake, MessageRegistry, ProtocolError, ProtocolVersion,
};

/// The protocol stack of one connection.
#[derive(Debug)]
pub struct Pipeline {
    pub version: ProtocolVersion,
    pub registry: &'static MessageRegistry,
    pub graph: &'static StateGraph,
    pub dechunker: Dechunker,
    pub chunker: Chunker,
}

impl Pipeline {
    /// Builds the pipeline for `version`. Framing sits in front of the
    /// codec; the registry and graph are shared with every other
    /// connection of the same version.
    pub fn select(version: ProtocolVersion, network: &NetworkConfig) -> Result<Self, ProtocolError> {
        Ok(Self {
            version,
            registry: MessageRegistry::for_version(version),
            graph: StateGraph::for_version(version),
            dechunker: Dechunker::new(network.max_message_size),
            chunker: Chunker::new(network.max_chunk_size)?,
        })
    }

    /// Negotiates from a raw client handshake and builds the pipeline.
    pub fn negotiate(
        handshake: &[u8],
        enabled: &[ProtocolVersion],
        network: &NetworkConfig,
    ) -> Result<Self, ProtocolError> {
        let version = Handshake::decode(handshake)?.negotiate(enabled)?;
        Self::select(version, network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Decision, State};
    use graphwire_protocol::{message::signature, RequestKind};

    #[test]
    fn test_select_per_version() {
        let network = NetworkConfig::default();

        let v1 = Pipeline::select(ProtocolVersion::V1, &network).unwrap();
        assert_eq!(v1.registry.version(), ProtocolVersion::V1);
        assert!(v1.registry.decoder_for(signature::BEGIN).is_none());
        assert_eq!(
            v1.graph.decide(State::Ready, RequestKind::Begin),
            Decision::Ignore
        );

        let v3 = Pipeline::select(ProtocolVersion::V3, &network).unwrap();
        assert!(v3.registry.decoder_for(signature::BEGIN).is_some());
        assert!(matches!(
            v3.graph.decide(State::Ready, RequestKind::Begin),
            Decision::Accept { .. }
        ));
        assert!(std::ptr::eq(
            v3.registry,
            MessageRegistry::for_version(ProtocolVersion::V3)
        ));
    }

    #[test]
    fn test_negotiate() {
        let network = NetworkConfig::default();
        let enabled = [ProtocolVersion::V1, ProtocolVersion::V3];

        let bytes = Handshake::new([4, 3, 2, 1]).encode();
        let pipeline = Pipeline::negotiate(&bytes, &enabled, &network).unwrap();
        assert_eq!(pipeline.version, ProtocolVersion::V3);

        let bytes = Handshake::new([2, 0, 0, 0]).encode();
        assert!(matches!(
            Pipeline::negotiate(&bytes, &enabled, &network),
            Err(ProtocolError::NoSupportedVersion(_))
        ));

        let mut bytes = Handshake::new([1, 0, 0, 0]).encode();
        bytes[0] = 0xFF;
        assert!(matches!(
            Pipeline::negotiate(&bytes, &enabled, &network),
            Err(ProtocolError::InvalidPreamble(_))
        ));
    }

    #[test]
    fn test_invalid_chunk_size_is_rejected() {
        let network = NetworkConfig {
            max_chunk_size: 0,
            ..NetworkConfig::default()
        };
        assert!(matches!(
            Pipeline::select(ProtocolVersion::V3, &network),
            Err(ProtocolError::InvalidChunkSize(0))
        ));
    }
}
