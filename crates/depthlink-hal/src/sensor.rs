//! Generic `DepthSensor` trait for depth-camera drivers.
//!
//! The physical driver is an external collaborator.  The rest of the stack
//! only ever talks to this trait, so a Kinect, a RealSense, or the
//! in-process [`SimDepthSensor`][crate::sim::SimDepthSensor] can be swapped
//! without touching the capture loop.

use depthlink_types::{DepthError, DepthFrame};

/// Static description of an opened sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    /// Stable identifier reported by the driver, e.g. a device serial.
    pub id: String,
    /// Depth frame width in pixels.
    pub width: u32,
    /// Depth frame height in pixels.
    pub height: u32,
    /// Whether the depth stream reports itself as active.
    pub active: bool,
}

impl SensorInfo {
    /// Pixels per depth frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A depth camera driver.
///
/// # Contract
///
/// * `open` – acquires the device.  Fails with
///   [`DepthError::DeviceUnavailable`] when no sensor is present.
/// * `latest_frame` – non-blocking; yields the newest complete frame the
///   driver holds, or `None`.  A frame is never partially written.
/// * `close` – releases the device; must tolerate repeated calls.
pub trait DepthSensor: Send {
    fn open(&mut self) -> Result<SensorInfo, DepthError>;

    fn latest_frame(&mut self) -> Option<DepthFrame>;

    fn close(&mut self);
}
