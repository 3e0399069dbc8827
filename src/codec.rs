use bytes::Bytes;
use thiserror::Error;
use wasession_core::binary::node::Node;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to encode node: {0}")]
    Encode(String),
}

/// Converts between frames and the tagged node tree.
pub trait WireCodec: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<Node, CodecError>;
    fn encode(&self, node: &Node) -> Result<Bytes, CodecError>;
}
