//! Network module for the robot session.
//!
//! The HTTP handshake lives in [`crate::handshake`]; this module holds the
//! WebRTC side: the peer connection, its `data` channel and the transport
//! the channel engine sends through.

pub mod webrtc;

pub use webrtc::{
    DataChannelTransport, IceServer, WebRtcConfig, WebRtcConnectionHandler, DATA_CHANNEL_LABEL,
};
