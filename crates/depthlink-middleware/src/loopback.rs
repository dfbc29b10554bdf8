//! In-process broker.
//!
//! [`LoopbackTransport`] keeps the broker protocol entirely in memory:
//! published payloads are echoed to the same client when it has subscribed to
//! the topic, every outbound operation is recorded, and tests can drive the
//! connection lifecycle by hand.  Hooks are always invoked with no internal
//! lock held.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use depthlink_types::DepthError;
use parking_lot::Mutex;
use tracing::debug;

use crate::transport::{BrokerTransport, TransportHooks};

/// One outbound operation seen by the loopback broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Open { uri: String },
    Subscribe { topic: String, type_tag: String },
    Unsubscribe { topic: String },
    Advertise { topic: String, type_tag: String },
    Publish { topic: String, payload: Vec<u8> },
    Close,
}

#[derive(Default)]
struct LoopState {
    hooks: Option<TransportHooks>,
    /// Hooks of the most recently closed socket.
    closed_hooks: Option<TransportHooks>,
    fail_next_subscribe: Option<DepthError>,
    subscribed: HashSet<String>,
    log: Vec<TransportOp>,
}

#[derive(Clone)]
pub struct LoopbackTransport {
    auto_connect: bool,
    state: Arc<Mutex<LoopState>>,
}

impl LoopbackTransport {
    /// Broker that reports "connected" as soon as it is opened.
    pub fn new() -> Self {
        Self {
            auto_connect: true,
            state: Arc::default(),
        }
    }

    /// Broker that stays silent after `open` until [`connect_now`] is called.
    ///
    /// [`connect_now`]: LoopbackTransport::connect_now
    pub fn silent() -> Self {
        Self {
            auto_connect: false,
            state: Arc::default(),
        }
    }

    fn hooks(&self) -> Option<TransportHooks> {
        self.state.lock().hooks.clone()
    }

    /// Fire the connected hook of the current socket.
    pub fn connect_now(&self) {
        if let Some(hooks) = self.hooks() {
            (hooks.on_connected)();
        }
    }

    /// Fire the connected hook of the socket that was last closed, as a
    /// handshake that completes after the client gave up would.
    pub fn connect_after_close(&self) {
        let hooks = self.state.lock().closed_hooks.clone();
        if let Some(hooks) = hooks {
            (hooks.on_connected)();
        }
    }

    /// Make the next `subscribe` fail with `error`.
    pub fn fail_next_subscribe(&self, error: DepthError) {
        self.state.lock().fail_next_subscribe = Some(error);
    }

    /// Simulate the remote end hanging up.
    pub fn drop_connection(&self) {
        let hooks = {
            let mut state = self.state.lock();
            state.subscribed.clear();
            state.hooks.take()
        };
        if let Some(hooks) = hooks {
            (hooks.on_closed)();
        }
    }

    /// Deliver `payload` on `topic` as if it came from another client.
    ///
    /// Topics this client never subscribed to are still delivered; filtering
    /// them is the receiver's job.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        if let Some(hooks) = self.hooks() {
            (hooks.on_message)(topic, payload);
        }
    }

    /// Every operation recorded so far.
    pub fn ops(&self) -> Vec<TransportOp> {
        self.state.lock().log.clone()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().subscribed.contains(topic)
    }

    /// Payloads published on `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|op| match op {
                TransportOp::Publish { topic: t, payload } if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn require_open(&self) -> Result<(), DepthError> {
        if self.state.lock().hooks.is_some() {
            Ok(())
        } else {
            Err(DepthError::NotConnected)
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for LoopbackTransport {
    async fn open(&self, uri: &str, hooks: TransportHooks) -> Result<(), DepthError> {
        {
            let mut state = self.state.lock();
            state.log.push(TransportOp::Open {
                uri: uri.to_string(),
            });
            state.subscribed.clear();
            state.hooks = Some(hooks);
        }
        debug!(uri, "Loopback broker opened");
        if self.auto_connect {
            self.connect_now();
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, type_tag: &str) -> Result<(), DepthError> {
        self.require_open()?;
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_subscribe.take() {
            return Err(error);
        }
        state.subscribed.insert(topic.to_string());
        state.log.push(TransportOp::Subscribe {
            topic: topic.to_string(),
            type_tag: type_tag.to_string(),
        });
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), DepthError> {
        self.require_open()?;
        let mut state = self.state.lock();
        state.subscribed.remove(topic);
        state.log.push(TransportOp::Unsubscribe {
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn advertise(&self, topic: &str, type_tag: &str) -> Result<(), DepthError> {
        self.require_open()?;
        self.state.lock().log.push(TransportOp::Advertise {
            topic: topic.to_string(),
            type_tag: type_tag.to_string(),
        });
        Ok(())
    }

    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), DepthError> {
        let echo = {
            let mut state = self.state.lock();
            let Some(hooks) = state.hooks.clone() else {
                return Err(DepthError::NotConnected);
            };
            state.log.push(TransportOp::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
            state.subscribed.contains(topic).then_some(hooks)
        };
        if let Some(hooks) = echo {
            (hooks.on_message)(topic, payload);
        }
        Ok(())
    }

    fn close(&self) {
        let hooks = {
            let mut state = self.state.lock();
            let hooks = state.hooks.take();
            if hooks.is_some() {
                state.log.push(TransportOp::Close);
                state.closed_hooks.clone_from(&hooks);
            }
            state.subscribed.clear();
            hooks
        };
        if let Some(hooks) = hooks {
            (hooks.on_closed)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hooks(connected: Arc<AtomicUsize>, messages: Arc<Mutex<Vec<String>>>) -> TransportHooks {
        TransportHooks {
            on_connected: Arc::new(move || {
                connected.fetch_add(1, Ordering::SeqCst);
            }),
            on_closed: Arc::new(|| {}),
            on_message: Arc::new(move |topic: &str, _: &[u8]| messages.lock().push(topic.to_string())),
        }
    }

    #[tokio::test]
    async fn auto_connect_fires_on_open() -> Result<(), DepthError> {
        let transport = LoopbackTransport::new();
        let connected = Arc::new(AtomicUsize::new(0));
        transport
            .open("ws://loop", counting_hooks(connected.clone(), Arc::default()))
            .await?;
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn silent_broker_waits_for_connect_now() -> Result<(), DepthError> {
        let transport = LoopbackTransport::silent();
        let connected = Arc::new(AtomicUsize::new(0));
        transport
            .open("ws://loop", counting_hooks(connected.clone(), Arc::default()))
            .await?;
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        transport.connect_now();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn publish_echoes_only_subscribed_topics() -> Result<(), DepthError> {
        let transport = LoopbackTransport::new();
        let messages = Arc::new(Mutex::new(Vec::new()));
        transport
            .open("ws://loop", counting_hooks(Arc::default(), messages.clone()))
            .await?;

        transport.subscribe("/a", "std_msgs/String")?;
        transport.send("/a", b"{}")?;
        transport.send("/b", b"{}")?;

        assert_eq!(*messages.lock(), vec!["/a"]);
        assert_eq!(transport.published("/b").len(), 1);
        Ok(())
    }

    #[test]
    fn operations_before_open_are_rejected() {
        let transport = LoopbackTransport::new();
        assert_eq!(
            transport.subscribe("/a", "std_msgs/String"),
            Err(DepthError::NotConnected)
        );
        assert_eq!(transport.send("/a", b"{}"), Err(DepthError::NotConnected));
        transport.close();
        assert!(transport.ops().is_empty());
    }

    #[tokio::test]
    async fn injected_subscribe_failure_happens_once() -> Result<(), DepthError> {
        let transport = LoopbackTransport::new();
        transport.open("ws://loop", counting_hooks(Arc::default(), Arc::default())).await?;
        transport.fail_next_subscribe(DepthError::Transport("socket hiccup".into()));

        assert!(matches!(
            transport.subscribe("/a", "std_msgs/String"),
            Err(DepthError::Transport(_))
        ));
        assert!(!transport.is_subscribed("/a"));
        transport.subscribe("/a", "std_msgs/String")?;
        assert!(transport.is_subscribed("/a"));
        Ok(())
    }

    #[tokio::test]
    async fn closed_socket_hooks_can_still_fire() -> Result<(), DepthError> {
        let transport = LoopbackTransport::silent();
        let connected = Arc::new(AtomicUsize::new(0));
        transport
            .open("ws://loop", counting_hooks(connected.clone(), Arc::default()))
            .await?;
        transport.close();

        transport.connect_now();
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        transport.connect_after_close();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
