//! Binary telemetry frame decoding.
//!
//! # Frame Format
//!
//! Each binary frame on the data channel consists of:
//! - 2 bytes: JSON header length N (little-endian u16)
//! - 2 bytes: reserved
//! - N bytes: UTF-8 JSON header
//! - remaining bytes: compressed payload
//!
//! The header carries a nested `data` object with the spatial calibration
//! (`origin`, `resolution`, plus whatever else the device includes). The
//! payload is handed to an injected [`Decompressor`] together with that
//! object, and the decoded mesh replaces the object's own `data` field.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FrameError;
use crate::messages::ChannelMessage;

/// Fixed prefix before the JSON header: 2 bytes length + 2 bytes reserved.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Key of the calibration object in the header, and of the payload inside it.
pub const FRAME_DATA_KEY: &str = "data";

/// Spatial calibration that accompanies a compressed voxel payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// World-space origin of the voxel grid.
    pub origin: [f64; 3],
    /// Edge length of one voxel.
    pub resolution: f64,
    /// Any further fields the device sends (passed through to the decompressor).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Geometry produced by the decompressor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelMesh {
    /// Number of points.
    pub point_count: u32,
    /// Number of faces.
    pub face_count: u32,
    /// Quantized vertex positions.
    pub positions: Vec<u8>,
    /// Texture coordinates.
    pub uvs: Vec<u8>,
    /// Triangle indices.
    pub indices: Vec<u32>,
}

/// Error returned by a [`Decompressor`].
pub type DecompressError = Box<dyn std::error::Error + Send + Sync>;

/// Pure function from a compressed payload plus calibration to geometry.
///
/// The algorithm is provided by the embedding application; tests substitute
/// a stub. Closures with the matching signature implement this trait.
pub trait Decompressor: Send + Sync {
    /// Decodes `payload` using `calibration`.
    fn decompress(&self, payload: &[u8], calibration: &Calibration)
        -> Result<VoxelMesh, DecompressError>;
}

impl<F> Decompressor for F
where
    F: Fn(&[u8], &Calibration) -> Result<VoxelMesh, DecompressError> + Send + Sync,
{
    fn decompress(
        &self,
        payload: &[u8],
        calibration: &Calibration,
    ) -> Result<VoxelMesh, DecompressError> {
        self(payload, calibration)
    }
}

/// Decompressor used when no decoding routine is available.
///
/// Every frame fails with [`FrameError::DecodeFailed`] and is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedDecompressor;

impl Decompressor for UnsupportedDecompressor {
    fn decompress(&self, payload: &[u8], _: &Calibration) -> Result<VoxelMesh, DecompressError> {
        Err(format!("no decompressor installed for {} byte payload", payload.len()).into())
    }
}

/// A binary frame split into its parts, before decompression.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame<'a> {
    /// Declared JSON header length.
    pub header_length: u16,
    /// The two reserved bytes, as received.
    pub reserved: [u8; 2],
    /// Parsed JSON header object.
    pub header: Map<String, Value>,
    /// Compressed payload bytes.
    pub payload: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// Splits a frame buffer and parses its JSON header.
    pub fn parse(buf: &'a [u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_PREFIX_SIZE {
            return Err(FrameError::Truncated {
                needed: FRAME_PREFIX_SIZE,
                available: buf.len(),
            });
        }

        let header_length = u16::from_le_bytes([buf[0], buf[1]]);
        let header_end = FRAME_PREFIX_SIZE + header_length as usize;
        if header_end > buf.len() {
            return Err(FrameError::Truncated {
                needed: header_end,
                available: buf.len(),
            });
        }

        let header_text = std::str::from_utf8(&buf[FRAME_PREFIX_SIZE..header_end])
            .map_err(|e| FrameError::BadHeader(format!("header is not UTF-8: {}", e)))?;
        let header = match serde_json::from_str::<Value>(header_text.trim_end_matches('\0')) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(FrameError::BadHeader(format!(
                    "header is not a JSON object: {}",
                    other
                )))
            }
            Err(e) => return Err(FrameError::BadHeader(format!("header is not JSON: {}", e))),
        };

        Ok(Self {
            header_length,
            reserved: [buf[2], buf[3]],
            header,
            payload: &buf[header_end..],
        })
    }

    /// Extracts the calibration object from the header.
    pub fn calibration(&self) -> Result<Calibration, FrameError> {
        let data = self
            .header
            .get(FRAME_DATA_KEY)
            .filter(|v| v.is_object())
            .ok_or_else(|| FrameError::BadHeader("header has no calibration object".into()))?;

        serde_json::from_value(data.clone())
            .map_err(|e| FrameError::BadHeader(format!("invalid calibration: {}", e)))
    }
}

/// Builds a binary frame from a header object and payload.
pub fn encode_frame(header: &Value, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header_text = header.to_string();
    let header_length = u16::try_from(header_text.len()).map_err(|_| {
        FrameError::BadHeader(format!("header of {} bytes is too long", header_text.len()))
    })?;

    let mut out = Vec::with_capacity(FRAME_PREFIX_SIZE + header_text.len() + payload.len());
    out.extend_from_slice(&header_length.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(header_text.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// A decoded frame: the header with the mesh spliced into its calibration object.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Augmented header.
    pub metadata: Value,
}

impl DecodedFrame {
    /// Returns the header as a channel message if it carries a `type`.
    pub fn to_message(&self) -> Option<ChannelMessage> {
        self.metadata
            .get("type")
            .filter(|t| t.is_string())
            .and_then(|_| serde_json::from_value(self.metadata.clone()).ok())
    }

    /// Returns the decoded mesh.
    pub fn mesh(&self) -> Option<VoxelMesh> {
        self.metadata
            .pointer("/data/data")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Decodes binary frames with an injected decompressor.
#[derive(Clone)]
pub struct FrameDecoder {
    decompressor: Arc<dyn Decompressor>,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder").finish_non_exhaustive()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Arc::new(UnsupportedDecompressor))
    }
}

impl FrameDecoder {
    /// Creates a decoder using `decompressor` for payloads.
    pub fn new(decompressor: Arc<dyn Decompressor>) -> Self {
        Self { decompressor }
    }

    /// Decodes one binary frame.
    pub fn decode(&self, buf: &[u8]) -> Result<DecodedFrame, FrameError> {
        let raw = RawFrame::parse(buf)?;
        let calibration = raw.calibration()?;

        let mesh = self
            .decompressor
            .decompress(raw.payload, &calibration)
            .map_err(|e| FrameError::DecodeFailed(e.to_string()))?;
        let mesh = serde_json::to_value(mesh)
            .map_err(|e| FrameError::DecodeFailed(format!("mesh not serializable: {}", e)))?;

        let mut header = raw.header;
        if let Some(Value::Object(data)) = header.get_mut(FRAME_DATA_KEY) {
            data.insert(FRAME_DATA_KEY.to_string(), mesh);
        }

        Ok(DecodedFrame {
            metadata: Value::Object(header),
        })
    }
}
