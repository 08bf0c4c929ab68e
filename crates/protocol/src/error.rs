//! Error types for the protocol crate.

use thiserror::Error;

/// Failures of the encrypted handshake with the device.
///
/// Any of these aborts the whole connection attempt. A new attempt must
/// generate a fresh session key and run every stage again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The device did not serve its public key (transport error or non-success status).
    #[error("device public key unavailable: {0}")]
    KeyUnavailable(String),

    /// The public key response could not be parsed.
    #[error("malformed device public key: {0}")]
    MalformedKey(String),

    /// The handshake submission failed at the transport level.
    #[error("handshake network failure: {0}")]
    Network(String),

    /// The device answered the submission with a non-success status or refused the session.
    #[error("device rejected handshake: {0}")]
    DeviceRejected(String),

    /// The device response could not be decrypted into text.
    #[error("failed to decrypt device response: {0}")]
    DecryptFailure(String),

    /// The offer could not be serialized or the answer could not be parsed.
    #[error("invalid session description: {0}")]
    Offer(String),
}

/// Failures of the data channel protocol engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Attempted to publish while the channel is not open.
    #[error("data channel is not open")]
    NotOpen,

    /// The channel closed before a reply arrived.
    #[error("data channel closed")]
    Closed,

    /// A newer publish registered the same correlation key.
    #[error("pending request superseded: {0}")]
    Superseded(String),

    /// The device validation could not be completed.
    #[error("device validation failed")]
    ValidationFailed,

    /// An outbound message could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialization(String),
}

/// Failures while decoding a binary telemetry frame.
///
/// Frame errors are local: the frame is dropped and later frames are unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer is shorter than its declared header length.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the frame header.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// The JSON header is not valid UTF-8 JSON or lacks calibration data.
    #[error("bad frame header: {0}")]
    BadHeader(String),

    /// The injected decompressor rejected the payload.
    #[error("payload decode failed: {0}")]
    DecodeFailed(String),
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Handshake failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Data channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Binary frame failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}
