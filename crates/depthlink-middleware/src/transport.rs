//! The broker transport collaborator.
//!
//! A [`BrokerTransport`] owns one socket to a pub/sub broker.  It never
//! reports progress through return values alone: connection completion,
//! closure, and inbound traffic are delivered through the
//! [`TransportHooks`] handed to [`BrokerTransport::open`], from whatever
//! task or thread the transport drives its socket on.
//!
//! Implementations:
//!
//! - [`RosbridgeTransport`][crate::rosbridge::RosbridgeTransport] – rosbridge
//!   v2 JSON over WebSocket.
//! - [`LoopbackTransport`][crate::loopback::LoopbackTransport] – in-process
//!   broker for tests and offline runs.

use std::sync::Arc;

use async_trait::async_trait;
use depthlink_types::DepthError;

/// Fired once the broker handshake completes.
pub type ConnectedHook = Arc<dyn Fn() + Send + Sync>;
/// Fired when the socket closes, whoever initiated it.
pub type ClosedHook = Arc<dyn Fn() + Send + Sync>;
/// Fired for every inbound message, in network-arrival order.
pub type MessageHook = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Event hooks registered on a transport.
#[derive(Clone)]
pub struct TransportHooks {
    pub on_connected: ConnectedHook,
    pub on_closed: ClosedHook,
    pub on_message: MessageHook,
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Start connecting to `uri`.
    ///
    /// Returns as soon as the attempt is underway; success or failure is
    /// signalled through `hooks`.  Re-opening replaces any previous socket.
    ///
    /// # Errors
    ///
    /// [`DepthError::Transport`] when the attempt cannot even be started
    /// (e.g. a malformed URI).
    async fn open(&self, uri: &str, hooks: TransportHooks) -> Result<(), DepthError>;

    /// Ask the broker to forward `topic` (of message type `type_tag`).
    fn subscribe(&self, topic: &str, type_tag: &str) -> Result<(), DepthError>;

    /// Stop forwarding `topic`.
    fn unsubscribe(&self, topic: &str) -> Result<(), DepthError>;

    /// Announce that this client will publish `topic`.
    fn advertise(&self, topic: &str, type_tag: &str) -> Result<(), DepthError>;

    /// Publish an encoded message on `topic`.
    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), DepthError>;

    /// Close the socket.  Tolerates repeated calls and an unopened transport.
    fn close(&self);
}
