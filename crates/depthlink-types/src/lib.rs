use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One snapshot of the depth sensor's sample grid.
///
/// Samples are row-major, one `u16` per pixel, and the sample count always
/// equals `width * height`.  The snapshot is immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthFrame {
    width: u32,
    height: u32,
    sequence: u64,
    samples: Vec<u16>,
}

impl DepthFrame {
    /// Build a frame, rejecting sample buffers that do not match the
    /// declared resolution.
    pub fn new(width: u32, height: u32, sequence: u64, samples: Vec<u16>) -> Result<Self, DepthError> {
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return Err(DepthError::InvalidConfig(format!(
                "depth frame {width}x{height} needs {expected} samples, got {}",
                samples.len()
            )));
        }
        Ok(Self {
            width,
            height,
            sequence,
            samples,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Monotonic counter assigned by the sensor driver.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Number of samples (pixels) in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A reprojected 3-D point in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Lifecycle of a broker connection.
///
/// `Disconnected → Connecting → {Connected, Failed}`, `Connected → Closed`.
/// `Failed` and `Closed` are terminal until a new connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Point cloud message
// ─────────────────────────────────────────────────────────────────────────────

/// ROS-style time stamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub secs: u32,
    pub nsecs: u32,
}

impl Stamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            secs: u32::try_from(at.timestamp()).unwrap_or(0),
            nsecs: at.timestamp_subsec_nanos(),
        }
    }
}

/// `sensor_msgs/PointField` datatype code for 32-bit floats.
pub const POINT_FIELD_FLOAT32: u8 = 7;

/// Describes one channel of a point record (`sensor_msgs/PointField`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointField {
    pub name: String,
    pub offset: u32,
    pub datatype: u8,
    pub count: u32,
}

/// Decoded point-cloud message (`sensor_msgs/PointCloud2` layout).
///
/// Immutable once decoded; handlers only ever see a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudFrame {
    pub seq: u32,
    pub stamp: Stamp,
    pub frame_id: String,
    pub height: u32,
    pub width: u32,
    pub fields: Vec<PointField>,
    pub is_bigendian: bool,
    pub point_step: u32,
    pub row_step: u32,
    pub data: Vec<u8>,
    pub is_dense: bool,
}

impl PointCloudFrame {
    /// Bytes per packed `x, y, z` float32 record.
    pub const XYZ_POINT_STEP: u32 = 12;

    /// Pack `points` as an unorganised (height 1) little-endian XYZ cloud.
    pub fn from_points(seq: u32, frame_id: impl Into<String>, points: &[Point3]) -> Self {
        let mut data = Vec::with_capacity(points.len() * Self::XYZ_POINT_STEP as usize);
        for p in points {
            data.extend_from_slice(&p.x.to_le_bytes());
            data.extend_from_slice(&p.y.to_le_bytes());
            data.extend_from_slice(&p.z.to_le_bytes());
        }
        let width = points.len() as u32;
        let is_dense = points
            .iter()
            .all(|p| p.x.is_finite() && p.y.is_finite() && p.z.is_finite());
        Self {
            seq,
            stamp: Stamp::now(),
            frame_id: frame_id.into(),
            height: 1,
            width,
            fields: ["x", "y", "z"]
                .iter()
                .enumerate()
                .map(|(i, name)| PointField {
                    name: (*name).to_string(),
                    offset: i as u32 * 4,
                    datatype: POINT_FIELD_FLOAT32,
                    count: 1,
                })
                .collect(),
            is_bigendian: false,
            point_step: Self::XYZ_POINT_STEP,
            row_step: width * Self::XYZ_POINT_STEP,
            data,
            is_dense,
        }
    }

    /// Number of point records carried in `data`.
    pub fn point_count(&self) -> usize {
        if self.point_step == 0 {
            return 0;
        }
        self.data.len() / self.point_step as usize
    }

    /// Unpack the leading `x, y, z` float32 channels of every record.
    ///
    /// # Errors
    ///
    /// Returns [`DepthError::Codec`] when the record is too short to hold
    /// three floats.
    pub fn points(&self) -> Result<Vec<Point3>, DepthError> {
        let step = self.point_step as usize;
        if step < Self::XYZ_POINT_STEP as usize {
            return Err(DepthError::Codec(format!(
                "point_step {step} is too small for an xyz record"
            )));
        }
        let read = |chunk: &[u8]| -> f32 {
            let bytes = [chunk[0], chunk[1], chunk[2], chunk[3]];
            if self.is_bigendian {
                f32::from_be_bytes(bytes)
            } else {
                f32::from_le_bytes(bytes)
            }
        };
        Ok(self
            .data
            .chunks_exact(step)
            .map(|rec| Point3::new(read(&rec[0..4]), read(&rec[4..8]), read(&rec[8..12])))
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reporting channel
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the reporting bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "depthlink-middleware::connector"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Observable conditions that never abort the running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// The broker handshake completed.
    Connected { uri: String },
    /// The broker connection closed (locally or remotely).
    Closed { uri: String },
    /// No connected signal arrived within the timeout.
    ConnectTimeout { uri: String, timeout_ms: u64 },
    /// A subscription handler returned an error or panicked.
    HandlerFailed {
        topic: String,
        handler_index: usize,
        message: String,
    },
    /// One capture tick was abandoned; the loop continues.
    FrameSkipped { reason: String },
    /// A monitored component stopped sending heartbeats.
    FrameStall { component: String },
}

/// Global error type spanning sensor, compute and broker failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DepthError {
    #[error("Depth sensor unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Depth sensor already open")]
    DeviceBusy,

    #[error("GPU allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Compute kernel '{0}' not found")]
    KernelNotFound(String),

    #[error("Buffer overflow: {required} bytes needed, capacity is {capacity}")]
    BufferOverflow { required: usize, capacity: usize },

    #[error("Compute dispatcher is not initialised")]
    NotInitialized,

    #[error("Point buffer handle from dispatch {handle} is stale (current {current})")]
    StaleHandle { handle: u64, current: u64 },

    #[error("Timed out after {timeout_ms} ms connecting to {uri}")]
    ConnectTimeout { uri: String, timeout_ms: u64 },

    #[error("Bridge is not connected")]
    NotConnected,

    #[error("Bridge was never connected")]
    AlreadyClosed,

    #[error("Topic '{topic}' is registered as {registered}, not {requested}")]
    TypeConflict {
        topic: String,
        registered: String,
        requested: String,
    },

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DepthError {
    /// `true` for conditions that must stop the pipeline from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DepthError::DeviceUnavailable(_)
                | DepthError::DeviceBusy
                | DepthError::AllocationFailed(_)
                | DepthError::KernelNotFound(_)
                | DepthError::InvalidConfig(_)
        )
    }
}
