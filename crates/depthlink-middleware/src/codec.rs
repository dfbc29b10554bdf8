//! Wire codecs for broker messages.
//!
//! Every payload type that crosses the broker implements [`BridgeMessage`]:
//! a stable type tag the broker understands plus JSON encode/decode.  The
//! rosbridge protocol carries `msg` bodies as JSON objects, so encoded bytes
//! are always one UTF-8 JSON document.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use depthlink_types::{DepthError, PointCloudFrame, PointField, Stamp};
use serde::{Deserialize, Serialize};

pub trait BridgeMessage: Sized + Send + Sync + 'static {
    /// Broker-side message type, e.g. `sensor_msgs/PointCloud2`.
    const TYPE_TAG: &'static str;

    fn encode(&self) -> Result<Vec<u8>, DepthError>;

    fn decode(raw: &[u8]) -> Result<Self, DepthError>;
}

// ────────────────────────────────────────────────────────────────────────────
// sensor_msgs/PointCloud2
// ────────────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireHeader {
    #[serde(default)]
    seq: u32,
    stamp: Stamp,
    frame_id: String,
}

/// rosbridge emits `uint8[]` as base64 by default but some bridges are
/// configured to send plain integer arrays.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireBytes {
    Base64(String),
    Array(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
struct WirePointCloud2 {
    header: WireHeader,
    height: u32,
    width: u32,
    fields: Vec<PointField>,
    is_bigendian: bool,
    point_step: u32,
    row_step: u32,
    data: WireBytes,
    is_dense: bool,
}

impl BridgeMessage for PointCloudFrame {
    const TYPE_TAG: &'static str = "sensor_msgs/PointCloud2";

    fn encode(&self) -> Result<Vec<u8>, DepthError> {
        let wire = WirePointCloud2 {
            header: WireHeader {
                seq: self.seq,
                stamp: self.stamp,
                frame_id: self.frame_id.clone(),
            },
            height: self.height,
            width: self.width,
            fields: self.fields.clone(),
            is_bigendian: self.is_bigendian,
            point_step: self.point_step,
            row_step: self.row_step,
            data: WireBytes::Base64(STANDARD.encode(&self.data)),
            is_dense: self.is_dense,
        };
        serde_json::to_vec(&wire).map_err(|e| DepthError::Codec(e.to_string()))
    }

    fn decode(raw: &[u8]) -> Result<Self, DepthError> {
        let wire: WirePointCloud2 =
            serde_json::from_slice(raw).map_err(|e| DepthError::Codec(e.to_string()))?;
        let data = match wire.data {
            WireBytes::Base64(text) => STANDARD
                .decode(text.as_bytes())
                .map_err(|e| DepthError::Codec(format!("PointCloud2 data: {e}")))?,
            WireBytes::Array(bytes) => bytes,
        };
        let expected = wire.row_step as usize * wire.height as usize;
        if data.len() < expected {
            return Err(DepthError::Codec(format!(
                "PointCloud2 data holds {} bytes, header promises {expected}",
                data.len()
            )));
        }
        Ok(PointCloudFrame {
            seq: wire.header.seq,
            stamp: wire.header.stamp,
            frame_id: wire.header.frame_id,
            height: wire.height,
            width: wire.width,
            fields: wire.fields,
            is_bigendian: wire.is_bigendian,
            point_step: wire.point_step,
            row_step: wire.row_step,
            data,
            is_dense: wire.is_dense,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// std_msgs/String
// ────────────────────────────────────────────────────────────────────────────

/// Plain text message, used for status and control topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub data: String,
}

impl TextMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl BridgeMessage for TextMessage {
    const TYPE_TAG: &'static str = "std_msgs/String";

    fn encode(&self) -> Result<Vec<u8>, DepthError> {
        serde_json::to_vec(self).map_err(|e| DepthError::Codec(e.to_string()))
    }

    fn decode(raw: &[u8]) -> Result<Self, DepthError> {
        serde_json::from_slice(raw).map_err(|e| DepthError::Codec(e.to_string()))
    }
}
