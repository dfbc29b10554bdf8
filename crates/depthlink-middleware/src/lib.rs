//! `depthlink-middleware` – Broker connectivity.
//!
//! Connects to a WebSocket pub/sub broker, fans typed inbound messages out to
//! handlers and publishes point clouds back.
//!
//! # Modules
//!
//! - [`bus`] – [`EventBus`]: Tokio broadcast channel carrying every non-fatal
//!   condition (timeouts, lifecycle changes, handler failures).
//! - [`transport`] – [`BrokerTransport`]: the socket collaborator contract and
//!   its event hooks.
//! - [`rosbridge`] – [`RosbridgeTransport`]: rosbridge v2 JSON over
//!   `tokio-tungstenite`.
//! - [`loopback`] – [`LoopbackTransport`]: in-process broker for tests and
//!   offline runs.
//! - [`codec`] – [`BridgeMessage`] wire codecs (`sensor_msgs/PointCloud2`,
//!   `std_msgs/String`).
//! - [`registry`] – [`TopicRegistry`]: topic → typed handler table with
//!   isolated fan-out.
//! - [`connector`] – [`BridgeConnector`]: connection state machine, connect
//!   timeout and the subscribe/publish surface.

pub mod bus;
pub mod codec;
pub mod connector;
pub mod loopback;
pub mod registry;
pub mod rosbridge;
pub mod transport;

pub use bus::{EventBus, SourceSubscriber};
pub use codec::{BridgeMessage, TextMessage};
pub use connector::{
    BridgeConnector, BrokerUri, ConnectorConfig, DEFAULT_CONNECT_TIMEOUT, LifecycleCallback,
};
pub use loopback::{LoopbackTransport, TransportOp};
pub use registry::{DispatchReport, TopicRegistry};
pub use rosbridge::RosbridgeTransport;
pub use transport::{BrokerTransport, TransportHooks};
