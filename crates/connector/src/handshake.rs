//! HTTP handshake that trades a local SDP offer for the robot's answer.
//!
//! Two flavours exist in the field:
//! - **Encrypted** (current firmware): the offer is AES-ECB encrypted under
//!   a fresh session key, the key is wrapped with the robot's RSA key
//!   (fetched from `/con_notify` on port 9991), and the envelope is posted
//!   to a per-attempt `/con_ing_{suffix}` path.
//! - **Legacy** (older firmware): the plain offer is posted to `/offer` on
//!   port 8081.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use protocol::crypto::{
    aes_ecb_decrypt, encrypt_handshake, HandshakeEnvelope, RemotePublicKey, SessionKey,
};
use protocol::error::HandshakeError;
use protocol::path::{derive_path_suffix, SUBMISSION_PATH_PREFIX};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Port serving the encrypted handshake endpoints.
pub const ENCRYPTED_PORT: u16 = 9991;

/// Port serving the legacy plain-text offer endpoint.
pub const LEGACY_PORT: u16 = 8081;

/// Identity the robot expects for clients on its local network.
pub const LOCAL_NETWORK_CLIENT_ID: &str = "STA_localNetwork";

/// Length of the marker on each side of the key in `data1`.
pub const NOTIFY_MARKER_LENGTH: usize = 10;

/// SDP value the robot answers with when another client holds the session.
const REJECT_SDP: &str = "reject";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Which handshake flavour to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeMethod {
    /// Try the encrypted handshake, fall back to legacy if no key is served.
    #[default]
    Auto,
    /// Encrypted handshake only.
    Encrypted,
    /// Legacy plain-text handshake only.
    Legacy,
}

impl fmt::Display for HandshakeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeMethod::Auto => "auto",
            HandshakeMethod::Encrypted => "encrypted",
            HandshakeMethod::Legacy => "legacy",
        })
    }
}

/// The offer document submitted to the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOffer {
    pub id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
}

impl SessionOffer {
    pub fn new(sdp: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: LOCAL_NETWORK_CLIENT_ID.to_string(),
            sdp: sdp.into(),
            kind: "offer".to_string(),
            token: token.into(),
        }
    }

    fn to_json(&self) -> Result<String, HandshakeError> {
        serde_json::to_string(self)
            .map_err(|e| HandshakeError::Offer(format!("failed to serialize offer: {}", e)))
    }
}

/// The robot's session description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionAnswer {
    /// Parses the answer document, treating the `reject` sentinel as busy.
    pub fn parse(text: &str) -> Result<Self, HandshakeError> {
        let answer: SessionAnswer = serde_json::from_str(text)
            .map_err(|e| HandshakeError::Offer(format!("invalid answer document: {}", e)))?;

        if answer.sdp == REJECT_SDP {
            return Err(HandshakeError::DeviceRejected(
                "device busy: another client is connected".to_string(),
            ));
        }
        Ok(answer)
    }
}

/// Decoded `/con_notify` payload.
#[derive(Debug, Deserialize)]
struct NotifyPayload {
    data1: String,
}

/// Key material announced by the robot for one attempt.
#[derive(Debug)]
pub struct DeviceNotice {
    /// Raw `data1` field; the submission path is derived from it.
    pub data1: String,
    /// The key found between the markers.
    pub public_key: RemotePublicKey,
}

impl DeviceNotice {
    /// Parses the base64 body of a `/con_notify` response.
    pub fn parse(body: &str) -> Result<Self, HandshakeError> {
        let decoded = BASE64
            .decode(body.trim().as_bytes())
            .map_err(|e| HandshakeError::MalformedKey(format!("notify body is not base64: {}", e)))?;
        let payload: NotifyPayload = serde_json::from_slice(&decoded)
            .map_err(|e| HandshakeError::MalformedKey(format!("notify body is not JSON: {}", e)))?;

        let public_key = RemotePublicKey::parse(strip_markers(&payload.data1)?)?;

        Ok(Self {
            data1: payload.data1,
            public_key,
        })
    }

    /// Path suffix the envelope must be posted under.
    pub fn path_suffix(&self) -> String {
        derive_path_suffix(&self.data1)
    }
}

/// Returns the key between the leading and trailing markers.
fn strip_markers(data1: &str) -> Result<&str, HandshakeError> {
    let char_count = data1.chars().count();
    if char_count <= 2 * NOTIFY_MARKER_LENGTH {
        return Err(HandshakeError::MalformedKey(format!(
            "data1 has {} characters, too short to carry a key",
            char_count
        )));
    }

    let byte_at = |n: usize| {
        data1
            .char_indices()
            .nth(n)
            .map(|(i, _)| i)
            .unwrap_or(data1.len())
    };
    let start = byte_at(NOTIFY_MARKER_LENGTH);
    let end = byte_at(char_count - NOTIFY_MARKER_LENGTH);
    Ok(&data1[start..end])
}

/// HTTP client for one robot.
#[derive(Debug, Clone)]
pub struct HandshakeClient {
    http: Client,
    address: String,
    encrypted_port: u16,
    legacy_port: u16,
}

impl HandshakeClient {
    /// Creates a client for the robot at `address` (host or IP, no port).
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self, HandshakeError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandshakeError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            address: address.into(),
            encrypted_port: ENCRYPTED_PORT,
            legacy_port: LEGACY_PORT,
        })
    }

    /// Overrides the ports, for robots behind a port-forward.
    pub fn with_ports(mut self, encrypted_port: u16, legacy_port: u16) -> Self {
        self.encrypted_port = encrypted_port;
        self.legacy_port = legacy_port;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn encrypted_url(&self, path: &str) -> String {
        format!("http://{}:{}/{}", self.address, self.encrypted_port, path)
    }

    fn legacy_url(&self) -> String {
        format!("http://{}:{}/offer", self.address, self.legacy_port)
    }

    /// Runs the handshake with the requested method.
    ///
    /// `Auto` runs the encrypted handshake once and only falls back to the
    /// legacy one when the robot serves no key.
    pub async fn negotiate(
        &self,
        method: HandshakeMethod,
        offer_sdp: &str,
        token: &str,
    ) -> Result<SessionAnswer, HandshakeError> {
        match method {
            HandshakeMethod::Encrypted => self.get_remote_answer(offer_sdp, token).await,
            HandshakeMethod::Legacy => self.legacy_offer(offer_sdp, token).await,
            HandshakeMethod::Auto => match self.get_remote_answer(offer_sdp, token).await {
                Err(HandshakeError::KeyUnavailable(reason)) => {
                    warn!(
                        "Encrypted handshake unavailable ({}), falling back to legacy",
                        reason
                    );
                    self.legacy_offer(offer_sdp, token).await
                }
                other => other,
            },
        }
    }

    /// Fetches the robot's public key and the raw `data1` it came in.
    pub async fn fetch_remote_public_key(&self) -> Result<DeviceNotice, HandshakeError> {
        let url = self.encrypted_url("con_notify");
        debug!("Fetching device key from {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| HandshakeError::KeyUnavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(HandshakeError::KeyUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HandshakeError::KeyUnavailable(format!("failed to read body: {}", e)))?;

        DeviceNotice::parse(&body)
    }

    /// Posts the envelope and returns the raw response body.
    pub async fn send_handshake(
        &self,
        envelope: &HandshakeEnvelope,
        url: &str,
    ) -> Result<String, HandshakeError> {
        let body = serde_json::to_string(envelope)
            .map_err(|e| HandshakeError::Offer(format!("failed to serialize envelope: {}", e)))?;

        debug!("Submitting encrypted offer to {}", url);
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| HandshakeError::Network(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HandshakeError::DeviceRejected(format!(
                "{} returned {}: {}",
                url, status, text
            )));
        }

        response
            .text()
            .await
            .map_err(|e| HandshakeError::Network(format!("failed to read response: {}", e)))
    }

    /// Runs the encrypted handshake.
    ///
    /// All per-attempt material (key, notice, envelope) lives and dies in
    /// this call; nothing is retried.
    pub async fn get_remote_answer(
        &self,
        offer_sdp: &str,
        token: &str,
    ) -> Result<SessionAnswer, HandshakeError> {
        let offer = SessionOffer::new(offer_sdp, token).to_json()?;
        let notice = self.fetch_remote_public_key().await?;

        let suffix = notice.path_suffix();
        if suffix.is_empty() {
            warn!(
                "Derived an empty path suffix from data1, submitting to /{}",
                SUBMISSION_PATH_PREFIX
            );
        }
        let url = self.encrypted_url(&format!("{}{}", SUBMISSION_PATH_PREFIX, suffix));

        let session_key = SessionKey::generate();
        let envelope = encrypt_handshake(&offer, &session_key, &notice.public_key)?;
        let response = self.send_handshake(&envelope, &url).await?;
        let plaintext = aes_ecb_decrypt(&response, &session_key)?;

        let answer = SessionAnswer::parse(&plaintext)?;
        info!("Encrypted handshake with {} complete", self.address);
        Ok(answer)
    }

    /// Runs the legacy plain-text handshake.
    pub async fn legacy_offer(
        &self,
        offer_sdp: &str,
        token: &str,
    ) -> Result<SessionAnswer, HandshakeError> {
        let url = self.legacy_url();
        debug!("Submitting legacy offer to {}", url);

        let response = self
            .http
            .post(&url)
            .json(&SessionOffer::new(offer_sdp, token))
            .send()
            .await
            .map_err(|e| HandshakeError::Network(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HandshakeError::DeviceRejected(format!(
                "{} returned {}",
                url, status
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| HandshakeError::Network(format!("failed to read response: {}", e)))?;

        let answer = SessionAnswer::parse(&text)?;
        info!("Legacy handshake with {} complete", self.address);
        Ok(answer)
    }
}
