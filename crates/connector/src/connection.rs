//! Connection orchestrator wiring the handshake, WebRTC and channel engine.
//!
//! A connection attempt runs strictly in order:
//! 1. build the peer connection and its `data` channel
//! 2. gather ICE and produce the local offer
//! 3. trade the offer for the robot's answer over HTTP
//! 4. apply the answer and wait for the data channel validation
//!
//! Any failure aborts the attempt; nothing is retried here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::framing::{Decompressor, FrameDecoder};
use protocol::validation::ValidationState;
use tracing::{debug, info, warn};

use crate::channel::ChannelEngine;
use crate::config::Config;
use crate::handshake::{HandshakeClient, HandshakeMethod, DEFAULT_HTTP_TIMEOUT};
use crate::network::webrtc::{WebRtcConfig, WebRtcConnectionHandler};

/// Default bound on the validation exchange after the channel opens.
pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Robot host or IP.
    pub address: String,
    /// Access token carried in the offer.
    pub token: String,
    /// Handshake flavour.
    pub method: HandshakeMethod,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// Bound on the validation exchange.
    pub validation_timeout: Duration,
    /// Peer connection settings.
    pub webrtc: WebRtcConfig,
    /// Decoder for binary telemetry frames.
    pub decoder: FrameDecoder,
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: String::new(),
            method: HandshakeMethod::Auto,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            webrtc: WebRtcConfig::default(),
            decoder: FrameDecoder::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_method(mut self, method: HandshakeMethod) -> Self {
        self.method = method;
        self
    }

    /// Installs the routine that decodes compressed voxel payloads.
    pub fn with_decompressor(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decoder = FrameDecoder::new(decompressor);
        self
    }
}

impl From<&Config> for ConnectOptions {
    fn from(config: &Config) -> Self {
        Self {
            address: config.device.address.clone(),
            token: config.device.token.clone(),
            method: config.device.handshake_method,
            http_timeout: config.network.http_timeout(),
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            webrtc: WebRtcConfig::from(&config.network),
            decoder: FrameDecoder::default(),
        }
    }
}

/// An open, validated session with a robot.
pub struct Go2Connection {
    address: String,
    handler: WebRtcConnectionHandler,
    engine: ChannelEngine,
}

impl Go2Connection {
    /// Opens a session and waits until the robot validates it.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        info!(
            "Connecting to {} using the {} handshake",
            options.address, options.method
        );

        let handler = WebRtcConnectionHandler::new(options.webrtc.clone())
            .await
            .context("Failed to set up WebRTC")?;
        let engine = ChannelEngine::new(handler.transport(), options.decoder.clone());

        match Self::establish(&handler, &engine, &options).await {
            Ok(()) => {
                info!("Session with {} validated", options.address);
                Ok(Self {
                    address: options.address,
                    handler,
                    engine,
                })
            }
            Err(e) => {
                engine.close();
                if let Err(close_err) = handler.close().await {
                    debug!("Error closing failed attempt: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn establish(
        handler: &WebRtcConnectionHandler,
        engine: &ChannelEngine,
        options: &ConnectOptions,
    ) -> Result<()> {
        handler.open_data_channel(engine).await?;
        let offer = handler.create_offer().await?;
        debug!("Local offer ready ({} bytes of SDP)", offer.sdp.len());

        let client = HandshakeClient::new(options.address.clone(), options.http_timeout)?;
        let answer = client
            .negotiate(options.method, &offer.sdp, &options.token)
            .await
            .with_context(|| format!("Handshake with {} failed", options.address))?;

        handler.set_remote_answer(answer.sdp).await?;

        match tokio::time::timeout(options.validation_timeout, engine.wait_validated()).await {
            Ok(result) => result.context("Data channel validation failed"),
            Err(_) => {
                warn!(
                    "Validation still {:?} after {:?}",
                    engine.validation_state(),
                    options.validation_timeout
                );
                anyhow::bail!(
                    "Robot did not validate the session within {:?}",
                    options.validation_timeout
                )
            }
        }
    }

    /// Address of the connected robot.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The protocol engine for publishing and subscribing.
    pub fn engine(&self) -> &ChannelEngine {
        &self.engine
    }

    pub fn is_validated(&self) -> bool {
        self.engine.validation_state() == ValidationState::Validated
    }

    /// Closes the data channel and the peer connection.
    pub async fn close(self) -> Result<()> {
        info!("Closing session with {}", self.address);
        self.engine.close();
        self.handler.close().await
    }
}
