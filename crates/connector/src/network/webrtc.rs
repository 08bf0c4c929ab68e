//! WebRTC peer connection to the robot.
//!
//! This module sets up the local side of the session:
//! - ICE server configuration (none needed on the robot's own network)
//! - One ordered data channel labelled `data`
//! - Receive-only video and audio transceivers, as the robot expects them
//!   in the offer
//! - Non-trickle offers: ICE gathering completes before the offer is handed
//!   to the HTTP handshake

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::error::ChannelError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::channel::{ChannelEngine, ChannelTransport};
use crate::config::NetworkConfig;

/// Label of the data channel the robot speaks its protocol on.
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Default bound on ICE gathering.
pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

/// ICE server configuration.
#[derive(Debug, Clone)]
pub struct IceServer {
    /// STUN server URLs.
    pub urls: Vec<String>,
}

impl IceServer {
    /// Creates a new STUN server configuration.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
        }
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            ..Default::default()
        }
    }
}

/// Configuration for the peer connection.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE servers for connectivity. Empty on the robot's local network.
    pub ice_servers: Vec<IceServer>,
    /// How long to wait for candidate gathering before offering anyway.
    pub ice_gathering_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_gathering_timeout: DEFAULT_ICE_GATHERING_TIMEOUT,
        }
    }
}

impl From<&NetworkConfig> for WebRtcConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            ice_servers: network.stun_servers.iter().map(IceServer::stun).collect(),
            ice_gathering_timeout: network.ice_gathering_timeout(),
        }
    }
}

impl WebRtcConfig {
    /// Converts to WebRTC RTCConfiguration.
    fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().cloned().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Outbound side of the data channel as seen by the [`ChannelEngine`].
///
/// Sends are queued on an unbounded channel and written by a dedicated task,
/// so callers never wait on the network.
#[derive(Debug)]
pub struct DataChannelTransport {
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl DataChannelTransport {
    fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            open: AtomicBool::new(false),
            outbound: Mutex::new(Some(outbound)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.outbound_rx).take()
    }

    /// Marks the channel closed and drops the queue's sender, which ends
    /// the writer task once the queue drains.
    pub fn shutdown(&self) {
        self.set_open(false);
        if lock(&self.outbound).take().is_some() {
            debug!("data channel transport shut down");
        }
    }
}

impl ChannelTransport for DataChannelTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        match lock(&self.outbound).as_ref() {
            Some(outbound) => outbound.send(text).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// WebRTC peer connection handler for one robot session.
pub struct WebRtcConnectionHandler {
    /// The WebRTC peer connection.
    peer_connection: Arc<RTCPeerConnection>,
    /// Peer connection settings.
    config: WebRtcConfig,
    /// Transport handed to the channel engine.
    transport: Arc<DataChannelTransport>,
}

impl WebRtcConnectionHandler {
    /// Creates the peer connection and its media transceivers.
    pub async fn new(config: WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("failed to register codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config.to_rtc_configuration())
                .await
                .context("failed to create peer connection")?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .with_context(|| format!("failed to add {} transceiver", kind))?;
        }

        peer_connection.on_track(Box::new(|track, _, _| {
            debug!("remote {} track {} received", track.kind(), track.id());
            Box::pin(async {})
        }));

        Ok(Self {
            peer_connection,
            config,
            transport: Arc::new(DataChannelTransport::new()),
        })
    }

    /// Returns the transport the channel engine sends through.
    pub fn transport(&self) -> Arc<DataChannelTransport> {
        Arc::clone(&self.transport)
    }

    /// Creates the `data` channel and bridges its events into `engine`.
    ///
    /// Must be called before [`Self::create_offer`] and only once.
    pub async fn open_data_channel(&self, engine: &ChannelEngine) -> Result<()> {
        let outbound = self
            .transport
            .take_outbound()
            .context("data channel already created")?;

        let channel = self
            .peer_connection
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .context("failed to create data channel")?;

        spawn_writer(Arc::clone(&channel), outbound);

        let transport = self.transport();
        let on_open_engine = engine.clone();
        channel.on_open(Box::new(move || {
            transport.set_open(true);
            info!("data channel '{}' open", DATA_CHANNEL_LABEL);
            on_open_engine.handle_open();
            Box::pin(async {})
        }));

        let on_message_engine = engine.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            if msg.is_string {
                on_message_engine.handle_text(&String::from_utf8_lossy(&msg.data));
            } else {
                on_message_engine.handle_binary(&msg.data);
            }
            Box::pin(async {})
        }));

        let transport = self.transport();
        let on_close_engine = engine.clone();
        channel.on_close(Box::new(move || {
            transport.shutdown();
            info!("data channel '{}' closed", DATA_CHANNEL_LABEL);
            on_close_engine.close();
            Box::pin(async {})
        }));

        let transport = self.transport();
        let on_state_engine = engine.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!("peer connection state changed: {:?}", state);
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    transport.shutdown();
                    on_state_engine.close();
                }
                Box::pin(async {})
            }));

        Ok(())
    }

    /// Creates the local offer and waits for ICE gathering.
    ///
    /// The returned description carries every gathered candidate.
    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("failed to create offer")?;

        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(offer)
            .await
            .context("failed to set local description")?;

        tokio::select! {
            _ = gathering_complete.recv() => {}
            _ = tokio::time::sleep(self.config.ice_gathering_timeout) => {
                warn!("ICE gathering timeout, proceeding with current candidates");
            }
        }

        self.peer_connection
            .local_description()
            .await
            .context("no local description available")
    }

    /// Applies the robot's answer.
    pub async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp).context("invalid SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("failed to set remote description")
    }

    /// Closes the peer connection.
    pub async fn close(&self) -> Result<()> {
        self.transport.shutdown();
        self.peer_connection
            .close()
            .await
            .context("failed to close peer connection")
    }

    /// Returns the underlying peer connection for advanced operations.
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

/// Drains queued text frames onto the data channel.
fn spawn_writer(channel: Arc<RTCDataChannel>, mut outbound: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = channel.send_text(text).await {
                warn!("failed to send on data channel: {}", e);
            }
        }
        debug!("data channel writer stopped");
    });
}
