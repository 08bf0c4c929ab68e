//! # go2link Connector Library
//!
//! Async client for Go2-class robots on their local network: the HTTP
//! handshake that authorizes a WebRTC session, and the protocol spoken on
//! the session's `data` channel.
//!
//! ## Overview
//!
//! - **Handshake**: encrypted (`/con_notify` + `/con_ing_{suffix}`) and
//!   legacy (`/offer`) offer/answer exchange over HTTP
//! - **Channel Engine**: validation, heartbeat, request/reply correlation,
//!   topic subscriptions and binary frame dispatch
//! - **Network**: the WebRTC peer connection and its data channel
//! - **Connection**: wires the above into one validated session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Go2Connection                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐   offer/answer   ┌──────────────────┐  │
//! │  │ HandshakeClient │ ◄──────────────► │  WebRTC Handler  │  │
//! │  └─────────────────┘                  └────────┬─────────┘  │
//! │                                                │ "data"     │
//! │  ┌─────────────────────────────────────────────▼─────────┐  │
//! │  │                    Channel Engine                     │  │
//! │  │  validation · heartbeat · pending · subscriptions     │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use connector::{ConnectOptions, Go2Connection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connection = Go2Connection::connect(ConnectOptions::new("192.168.12.1")).await?;
//!
//!     let mut lowstate = connection.engine().subscribe("rt/lf/lowstate")?;
//!     if let Some(message) = lowstate.recv().await {
//!         println!("{}", message.data);
//!     }
//!
//!     connection.close().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`handshake`]: HTTP offer/answer exchange
//! - [`channel`]: Data channel protocol engine
//! - [`network`]: WebRTC peer connection
//! - [`connection`]: Session orchestration

pub mod channel;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod network;

// Re-export protocol for convenience
pub use protocol;

pub use channel::{ChannelEngine, ChannelTransport, EngineConfig, ReplyFuture};
pub use config::{Config, ConfigError};
pub use connection::{ConnectOptions, Go2Connection};
pub use handshake::{HandshakeClient, HandshakeMethod, SessionAnswer, SessionOffer};
pub use network::{DataChannelTransport, IceServer, WebRtcConfig, WebRtcConnectionHandler};
