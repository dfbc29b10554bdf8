//! [`FrameSource`] – owns the depth reader lifecycle.
//!
//! Polling is non-blocking and always "latest wins": when several frames
//! arrive between two polls only the newest is returned, and a slow consumer
//! silently skips the intermediate ones.  The returned frame borrows the
//! source, so it cannot outlive the next poll that overwrites it.

use depthlink_types::{DepthError, DepthFrame};
use tracing::{debug, info};

use crate::sensor::{DepthSensor, SensorInfo};

pub struct FrameSource {
    sensor: Box<dyn DepthSensor>,
    info: Option<SensorInfo>,
    current: Option<DepthFrame>,
    last_sequence: Option<u64>,
}

impl FrameSource {
    /// Wrap `sensor`.  The device is not touched until [`open`][Self::open].
    pub fn new(sensor: Box<dyn DepthSensor>) -> Self {
        Self {
            sensor,
            info: None,
            current: None,
            last_sequence: None,
        }
    }

    /// Acquire the hardware reader.
    ///
    /// # Errors
    ///
    /// * [`DepthError::DeviceBusy`] if this source is already open.
    /// * [`DepthError::DeviceUnavailable`] if the driver finds no sensor.
    pub fn open(&mut self) -> Result<&SensorInfo, DepthError> {
        if self.info.is_some() {
            return Err(DepthError::DeviceBusy);
        }
        let info = self.sensor.open()?;
        info!(
            sensor = %info.id,
            width = info.width,
            height = info.height,
            active = info.active,
            "depth sensor opened"
        );
        self.last_sequence = None;
        Ok(self.info.insert(info))
    }

    pub fn is_open(&self) -> bool {
        self.info.is_some()
    }

    /// Description of the open sensor, if any.
    pub fn info(&self) -> Option<&SensorInfo> {
        self.info.as_ref()
    }

    /// Return the newest frame since the previous call, or `None` when no new
    /// frame has arrived (or the source is closed).
    pub fn poll_latest(&mut self) -> Option<&DepthFrame> {
        self.info.as_ref()?;
        let frame = self.sensor.latest_frame()?;
        if self
            .last_sequence
            .is_some_and(|last| frame.sequence() <= last)
        {
            debug!(sequence = frame.sequence(), "depth frame already seen");
            return None;
        }
        self.last_sequence = Some(frame.sequence());
        Some(&*self.current.insert(frame))
    }

    /// Release the reader.  Safe to call repeatedly or without `open`.
    pub fn close(&mut self) {
        if let Some(info) = self.info.take() {
            self.sensor.close();
            info!(sensor = %info.id, "depth sensor closed");
        }
        self.current = None;
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
