//! In-process simulated depth sensor for CI/CD testing without hardware.
//!
//! [`SimDepthSensor`] holds a single "latest frame" slot.  Producers push
//! frames through a cloneable [`SimFeed`]; every push overwrites the slot, so
//! the sensor has exactly the drop-on-overwrite behaviour of a real depth
//! reader.
//!
//! # Example
//!
//! ```rust
//! use depthlink_hal::{FrameSource, SimDepthSensor};
//!
//! let sensor = SimDepthSensor::new("sim_depth", 4, 2);
//! let feed = sensor.feed();
//! let mut source = FrameSource::new(Box::new(sensor));
//! source.open().expect("sim sensor must open");
//!
//! feed.push(vec![1000; 8]).expect("frame has the right size");
//! assert_eq!(source.poll_latest().map(|f| f.len()), Some(8));
//! ```

use std::sync::Arc;

use depthlink_types::{DepthError, DepthFrame};
use parking_lot::Mutex;

use crate::sensor::{DepthSensor, SensorInfo};

/// Kinect v2 depth resolution.
pub const KINECT_V2_WIDTH: u32 = 512;
pub const KINECT_V2_HEIGHT: u32 = 424;

#[derive(Default)]
struct Slot {
    latest: Option<DepthFrame>,
    next_sequence: u64,
}

/// A simulated depth camera backed by a shared latest-frame slot.
pub struct SimDepthSensor {
    id: String,
    width: u32,
    height: u32,
    present: bool,
    opened: bool,
    slot: Arc<Mutex<Slot>>,
}

impl SimDepthSensor {
    /// Create a present sensor with the given resolution.
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            present: true,
            opened: false,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// A sensor at the Kinect v2 depth resolution (512×424).
    pub fn kinect_v2(id: impl Into<String>) -> Self {
        Self::new(id, KINECT_V2_WIDTH, KINECT_V2_HEIGHT)
    }

    /// A sensor that is not plugged in; `open` always fails.
    pub fn unavailable() -> Self {
        Self {
            present: false,
            ..Self::new("absent", 0, 0)
        }
    }

    /// Producer handle that writes into this sensor's frame slot.
    pub fn feed(&self) -> SimFeed {
        SimFeed {
            width: self.width,
            height: self.height,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl DepthSensor for SimDepthSensor {
    fn open(&mut self) -> Result<SensorInfo, DepthError> {
        if !self.present {
            return Err(DepthError::DeviceUnavailable(
                "no simulated sensor attached".to_string(),
            ));
        }
        self.opened = true;
        Ok(SensorInfo {
            id: self.id.clone(),
            width: self.width,
            height: self.height,
            active: true,
        })
    }

    fn latest_frame(&mut self) -> Option<DepthFrame> {
        if !self.opened {
            return None;
        }
        self.slot.lock().latest.take()
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

/// Cloneable producer side of a [`SimDepthSensor`].
#[derive(Clone)]
pub struct SimFeed {
    width: u32,
    height: u32,
    slot: Arc<Mutex<Slot>>,
}

impl SimFeed {
    /// Overwrite the latest frame with `samples`, returning its sequence
    /// number.  Any frame not yet polled is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DepthError::InvalidConfig`] when `samples` does not match the
    /// sensor resolution.
    pub fn push(&self, samples: Vec<u16>) -> Result<u64, DepthError> {
        let mut slot = self.slot.lock();
        let sequence = slot.next_sequence;
        slot.latest = Some(DepthFrame::new(self.width, self.height, sequence, samples)?);
        slot.next_sequence += 1;
        Ok(sequence)
    }

    /// Push a synthetic tilted-plane frame whose depth ripples with `phase`.
    pub fn push_synthetic(&self, phase: f32) -> Result<u64, DepthError> {
        self.push(synthetic_depth(self.width, self.height, phase))
    }
}

/// Generate a tilted plane between 0.8 m and 4.0 m with a travelling ripple,
/// in millimetres.
pub fn synthetic_depth(width: u32, height: u32, phase: f32) -> Vec<u16> {
    let mut samples = Vec::with_capacity(width as usize * height as usize);
    for v in 0..height {
        for u in 0..width {
            let ramp = u as f32 / width.max(1) as f32;
            let ripple = ((v as f32 * 0.05) + phase).sin() * 50.0;
            let mm = 800.0 + ramp * 3200.0 + ripple;
            samples.push(mm.clamp(0.0, u16::MAX as f32) as u16);
        }
    }
    samples
}
