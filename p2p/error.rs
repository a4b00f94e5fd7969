use std::time::SystemTimeError;
use thiserror::Error;

/// Top level error type for the discv5 stack.
///
/// Protocol-layer variants (everything other than [`DiscoveryError::IoError`] and
/// [`DiscoveryError::SystemTimeError`]) are never fatal: a malicious or buggy peer can
/// trigger any of them, and the caller is expected to log and move on rather than tear
/// anything down.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    SystemTimeError(#[from] SystemTimeError),
    #[error(transparent)]
    RLPDecodeError(#[from] discv5_rlp::error::RLPDecodeError),

    #[error("Failed to decode packet: {0}")]
    PacketDecodeFailure(String),
    #[error("Failed to decrypt message from {node_id}")]
    DecryptionError { node_id: String },
    #[error("Handshake with {node_id} failed: {reason}")]
    HandshakeFailure { node_id: String, reason: String },
    #[error("Received a message of an unexpected type: {0}")]
    UnexpectedMessage(String),
    #[error("Request to {node_id} timed out")]
    RequestTimeout { node_id: String },
    #[error("Exhausted request id attempts for {node_id}")]
    ExhaustedRequestIds { node_id: String },
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("A handler is already registered for message type {0}")]
    HandlerAlreadyRegistered(u8),
    #[error("A response handler is already registered for request to {node_id}")]
    DuplicateResponseHandler { node_id: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
