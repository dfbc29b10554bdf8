//! Broker connection lifecycle and typed subscriptions.
//!
//! [`BridgeConnector`] owns one [`BrokerTransport`] and walks it through the
//! connection state machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──connected──▶ Connected
//!                               │    ▲                    │
//!                         timeout│   │late connected      │closed
//!                               ▼    │                    ▼
//!                             Failed ┘                  Closed
//! ```
//!
//! `close()` moves every state except `Disconnected` to `Closed`, and a later
//! `connect()` starts a fresh attempt.  Signals from a superseded attempt are
//! ignored, as is anything the transport reports after a close.
//!
//! State transitions are serialised through a [`tokio::sync::watch`]
//! channel, so observers (including the pending connect task) see every
//! change in order.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use depthlink_types::{ConnectionState, DepthError, EventPayload};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bus::EventBus;
use crate::codec::BridgeMessage;
use crate::registry::TopicRegistry;
use crate::transport::{BrokerTransport, TransportHooks};

const SOURCE: &str = "depthlink-middleware::connector";

/// Default wait for the broker handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// User callback fired on lifecycle transitions.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Broker endpoint, rendered as `scheme://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for BrokerUri {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub uri: BrokerUri,
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            uri: BrokerUri::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connector
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Callbacks {
    on_connected: Option<LifecycleCallback>,
    on_closed: Option<LifecycleCallback>,
}

struct Inner {
    uri: String,
    timeout: Duration,
    transport: Arc<dyn BrokerTransport>,
    registry: TopicRegistry,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    attempt: AtomicU64,
    callbacks: Mutex<Callbacks>,
    advertised: Mutex<HashSet<String>>,
}

pub struct BridgeConnector {
    inner: Arc<Inner>,
}

impl BridgeConnector {
    pub fn new(config: ConnectorConfig, transport: Arc<dyn BrokerTransport>, bus: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                uri: config.uri.to_string(),
                timeout: config.connect_timeout,
                transport,
                registry: TopicRegistry::with_bus(bus.clone()),
                bus,
                state,
                attempt: AtomicU64::new(0),
                callbacks: Mutex::default(),
                advertised: Mutex::default(),
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.inner.registry
    }

    /// Begin connecting without blocking the caller.
    ///
    /// The returned task resolves once the attempt settles: `Ok(())` on
    /// connect, [`DepthError::ConnectTimeout`] when no connected signal
    /// arrives in time (the connector is then `Failed`, and a late signal
    /// still promotes it to `Connected`).  Calling `connect` while already
    /// connected resolves to `Ok(())` at once.  Calling it while an attempt
    /// is in flight starts nothing new; the returned task follows that
    /// attempt and resolves to [`DepthError::NotConnected`] if it does not
    /// end `Connected`.
    ///
    /// `on_connected` / `on_closed` replace any previously registered
    /// callbacks and fire on the transport's signal context.
    pub fn connect(
        &self,
        on_connected: Option<LifecycleCallback>,
        on_closed: Option<LifecycleCallback>,
    ) -> JoinHandle<Result<(), DepthError>> {
        let inner = Arc::clone(&self.inner);

        let mut started = None;
        inner.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                *state = ConnectionState::Connecting;
                started = Some(inner.attempt.fetch_add(1, Ordering::SeqCst) + 1);
                true
            }
        });
        let Some(attempt) = started else {
            debug!(uri = %inner.uri, state = %self.state(), "connect() joins the current attempt");
            let mut state_rx = inner.state.subscribe();
            let timeout = inner.timeout;
            return tokio::spawn(async move {
                let settled = tokio::time::timeout(
                    timeout,
                    state_rx.wait_for(|s| *s != ConnectionState::Connecting),
                )
                .await;
                match settled {
                    Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
                    _ => Err(DepthError::NotConnected),
                }
            });
        };

        *inner.callbacks.lock() = Callbacks {
            on_connected,
            on_closed,
        };
        info!(uri = %inner.uri, attempt, "Connecting to broker");

        tokio::spawn(async move { inner.run_attempt(attempt).await })
    }

    /// Register `handler` for `topic`, subscribing on the broker the first
    /// time the topic is seen.
    ///
    /// # Errors
    ///
    /// - [`DepthError::NotConnected`] unless the connector is `Connected`.
    /// - [`DepthError::TypeConflict`] when `topic` already carries another
    ///   message type.
    /// - Any transport error from the broker subscribe.  A topic that was new
    ///   is then unregistered again, so retrying is safe.
    pub fn subscribe_to<M, F>(&self, topic: &str, handler: F) -> Result<(), DepthError>
    where
        M: BridgeMessage,
        F: Fn(&M) -> Result<(), DepthError> + Send + Sync + 'static,
    {
        if !self.is_connected() {
            return Err(DepthError::NotConnected);
        }
        if self.inner.registry.register::<M, F>(topic, handler)? {
            if let Err(e) = self.inner.transport.subscribe(topic, M::TYPE_TAG) {
                // Leave no entry behind so a retry subscribes again.
                self.inner.registry.remove(topic);
                return Err(e);
            }
            info!(topic, type_tag = M::TYPE_TAG, "Subscribed");
        }
        Ok(())
    }

    /// Drop every registration, unsubscribing on the broker when connected.
    pub fn unsubscribe_from_all(&self) {
        let topics = self.inner.registry.clear();
        if !self.is_connected() {
            return;
        }
        for topic in topics {
            if let Err(e) = self.inner.transport.unsubscribe(&topic) {
                warn!(topic = %topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Encode `msg` and publish it on `topic`, advertising the topic first
    /// if this connection has not yet done so.
    pub fn publish<M: BridgeMessage>(&self, topic: &str, msg: &M) -> Result<(), DepthError> {
        if !self.is_connected() {
            return Err(DepthError::NotConnected);
        }
        let payload = msg.encode()?;
        let first_use = self.inner.advertised.lock().insert(topic.to_string());
        if first_use {
            if let Err(e) = self.inner.transport.advertise(topic, M::TYPE_TAG) {
                self.inner.advertised.lock().remove(topic);
                return Err(e);
            }
        }
        self.inner.transport.send(topic, &payload)
    }

    /// Close the connection.
    ///
    /// Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// [`DepthError::AlreadyClosed`] when `connect` was never called.
    pub fn close(&self) -> Result<(), DepthError> {
        let mut previous = ConnectionState::Closed;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            match state {
                ConnectionState::Disconnected | ConnectionState::Closed => false,
                _ => {
                    *state = ConnectionState::Closed;
                    true
                }
            }
        });

        match previous {
            ConnectionState::Disconnected => Err(DepthError::AlreadyClosed),
            ConnectionState::Closed => Ok(()),
            _ => {
                self.inner.transport.close();
                self.inner.advertised.lock().clear();
                info!(uri = %self.inner.uri, from = %previous, "Broker connection closed");
                if previous == ConnectionState::Connected {
                    self.inner.announce_closed();
                }
                Ok(())
            }
        }
    }
}

impl Drop for BridgeConnector {
    fn drop(&mut self) {
        if !matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            let _ = self.close();
        }
    }
}

impl Inner {
    fn hooks(self: &Arc<Self>, attempt: u64) -> TransportHooks {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let on_connected = {
            let weak = weak.clone();
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_connected(attempt);
                }
            })
        };
        let on_closed = {
            let weak = weak.clone();
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_closed(attempt);
                }
            })
        };
        let on_message = Arc::new(move |topic: &str, raw: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(attempt, topic, raw);
            }
        });
        TransportHooks {
            on_connected,
            on_closed,
            on_message,
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn run_attempt(self: Arc<Self>, attempt: u64) -> Result<(), DepthError> {
        let mut state_rx = self.state.subscribe();

        if let Err(e) = self.transport.open(&self.uri, self.hooks(attempt)).await {
            warn!(uri = %self.uri, error = %e, "Broker transport refused to open");
            self.fail(attempt);
            return Err(e);
        }

        let settled = tokio::time::timeout(
            self.timeout,
            state_rx.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await;

        match settled {
            Ok(Ok(state)) => match *state {
                ConnectionState::Connected => Ok(()),
                ConnectionState::Closed => Err(DepthError::AlreadyClosed),
                _ => Err(DepthError::Transport(format!(
                    "broker at {} closed before connecting",
                    self.uri
                ))),
            },
            Ok(Err(_)) => Err(DepthError::NotConnected),
            Err(_elapsed) => {
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                if self.fail(attempt) {
                    warn!(uri = %self.uri, timeout_ms, "Failed to connect to broker");
                    self.bus.report(
                        SOURCE,
                        EventPayload::ConnectTimeout {
                            uri: self.uri.clone(),
                            timeout_ms,
                        },
                    );
                    return Err(DepthError::ConnectTimeout {
                        uri: self.uri.clone(),
                        timeout_ms,
                    });
                }
                // The handshake landed between the timeout and the transition.
                if *self.state.borrow() == ConnectionState::Connected {
                    Ok(())
                } else {
                    Err(DepthError::NotConnected)
                }
            }
        }
    }

    /// `Connecting → Failed` for the current attempt. Returns whether the
    /// transition happened.
    fn fail(&self, attempt: u64) -> bool {
        self.state.send_if_modified(|state| {
            if self.is_current(attempt) && *state == ConnectionState::Connecting {
                *state = ConnectionState::Failed;
                true
            } else {
                false
            }
        })
    }

    fn handle_connected(&self, attempt: u64) {
        let promoted = self.state.send_if_modified(|state| {
            if self.is_current(attempt)
                && matches!(*state, ConnectionState::Connecting | ConnectionState::Failed)
            {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !promoted {
            debug!(uri = %self.uri, attempt, "Ignoring stale connected signal");
            return;
        }

        info!(uri = %self.uri, "Connected to broker");
        // Topics registered on an earlier connection are re-requested.
        for (topic, type_tag) in self.registry.topics() {
            if let Err(e) = self.transport.subscribe(&topic, type_tag) {
                warn!(topic = %topic, error = %e, "Resubscribe failed");
            }
        }
        self.bus.report(
            SOURCE,
            EventPayload::Connected {
                uri: self.uri.clone(),
            },
        );
        let callback = self.callbacks.lock().on_connected.clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn handle_closed(&self, attempt: u64) {
        let mut previous = ConnectionState::Closed;
        self.state.send_if_modified(|state| {
            previous = *state;
            if !self.is_current(attempt) {
                return false;
            }
            match state {
                ConnectionState::Connected => {
                    *state = ConnectionState::Closed;
                    true
                }
                ConnectionState::Connecting => {
                    *state = ConnectionState::Failed;
                    true
                }
                _ => false,
            }
        });

        match previous {
            ConnectionState::Connected if self.is_current(attempt) => {
                self.advertised.lock().clear();
                warn!(uri = %self.uri, "Broker closed the connection");
                self.announce_closed();
            }
            ConnectionState::Connecting if self.is_current(attempt) => {
                warn!(uri = %self.uri, "Broker connection failed before handshake");
            }
            _ => debug!(uri = %self.uri, attempt, "Ignoring closed signal"),
        }
    }

    fn handle_message(&self, attempt: u64, topic: &str, raw: &[u8]) {
        if !self.is_current(attempt) || *self.state.borrow() != ConnectionState::Connected {
            debug!(topic, "Dropping message received outside a live connection");
            return;
        }
        if let Err(e) = self.registry.dispatch(topic, raw) {
            warn!(topic, error = %e, "Dropping undecodable message");
        }
    }

    fn announce_closed(&self) {
        self.bus.report(
            SOURCE,
            EventPayload::Closed {
                uri: self.uri.clone(),
            },
        );
        let callback = self.callbacks.lock().on_closed.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}
