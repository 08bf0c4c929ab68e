//! # go2link Protocol Library
//!
//! Transport-free building blocks for talking to a Go2-class robot over its
//! local-network WebRTC session.
//!
//! ## Overview
//!
//! - **Handshake Cryptography**: AES-256-ECB offer encryption and chunked RSA
//!   PKCS#1 v1.5 key wrapping, bit-exact with the device firmware
//! - **Path Derivation**: the per-attempt `con_ing_{suffix}` submission path
//! - **Messages**: `{type, topic, data}` data channel messages and reply
//!   correlation
//! - **Validation**: the challenge/response state machine run after the data
//!   channel opens
//! - **Framing**: binary telemetry frames and the injected voxel decompressor
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Channel Messages / Binary Frames      │  JSON text, LE-prefixed binary
//! ├─────────────────────────────────────────┤
//! │        Validation + Heartbeat           │  MD5 challenge response
//! ├─────────────────────────────────────────┤
//! │      WebRTC Data Channel ("data")       │
//! ├─────────────────────────────────────────┤
//! │   Handshake (AES-ECB + RSA PKCS#1v1.5)  │  HTTP :9991
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::crypto::{aes_ecb_decrypt, aes_ecb_encrypt, SessionKey};
//! use protocol::path::derive_path_suffix;
//!
//! let key = SessionKey::generate();
//! let ciphertext = aes_ecb_encrypt(b"{\"type\":\"offer\"}", &key);
//! assert_eq!(aes_ecb_decrypt(&ciphertext, &key).unwrap(), "{\"type\":\"offer\"}");
//!
//! assert_eq!(derive_path_suffix("xAxBxCxDxE"), "01234");
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Session keys, AES-ECB, RSA key wrapping, validation digest
//! - [`path`]: Submission path derivation
//! - [`messages`]: Data channel message definitions
//! - [`validation`]: Validation state machine
//! - [`framing`]: Binary frame decoding
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod path;
pub mod validation;

pub use crypto::{
    encrypt_handshake, validation_response, HandshakeEnvelope, RemotePublicKey, SessionKey,
    AES_BLOCK_SIZE, SESSION_KEY_LENGTH,
};
pub use error::{ChannelError, FrameError, HandshakeError, ProtocolError, Result};
pub use framing::{
    Calibration, DecodedFrame, DecompressError, Decompressor, FrameDecoder, RawFrame,
    UnsupportedDecompressor, VoxelMesh, FRAME_PREFIX_SIZE,
};
pub use messages::{
    correlation_id, ChannelMessage, CorrelationId, CorrelationKey, HeartbeatData, MessageType,
    RequestPayload, VALIDATION_OK,
};
pub use path::{derive_path_suffix, submission_path};
pub use validation::{ValidationMachine, ValidationState};
