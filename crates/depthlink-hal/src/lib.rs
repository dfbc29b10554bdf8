//! `depthlink-hal` – Depth sensor abstraction.
//!
//! # Modules
//!
//! - [`sensor`] – [`DepthSensor`]: the driver contract every depth camera
//!   implements.
//! - [`frame_source`] – [`FrameSource`]: owns the reader lifecycle and
//!   exposes a non-blocking, latest-wins poll.
//! - [`sim`] – [`SimDepthSensor`]: an in-process sensor for tests and
//!   headless runs.

pub mod frame_source;
pub mod sensor;
pub mod sim;

pub use frame_source::FrameSource;
pub use sensor::{DepthSensor, SensorInfo};
pub use sim::{SimDepthSensor, SimFeed};
