//! rosbridge v2 transport.
//!
//! [`RosbridgeTransport`] speaks the rosbridge JSON protocol over a
//! `tokio-tungstenite` WebSocket:
//!
//! ```json
//! {"op": "subscribe",   "topic": "/depth/points", "type": "sensor_msgs/PointCloud2"}
//! {"op": "unsubscribe", "topic": "/depth/points"}
//! {"op": "advertise",   "topic": "/depth/points", "type": "sensor_msgs/PointCloud2"}
//! {"op": "publish",     "topic": "/depth/points", "msg": { ... }}
//! ```
//!
//! One background task owns the socket.  It connects, fires the hooks, drains
//! the outbound queue and forwards inbound `publish` ops to
//! [`TransportHooks::on_message`] in arrival order.  Operations issued before
//! the handshake completes are queued and flushed once it does.

use async_trait::async_trait;
use depthlink_types::DepthError;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::transport::{BrokerTransport, TransportHooks};

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    stop: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct RosbridgeTransport {
    link: Mutex<Option<Link>>,
}

impl RosbridgeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, op: Value) -> Result<(), DepthError> {
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(DepthError::NotConnected)?;
        link.outbound
            .send(Message::Text(op.to_string().into()))
            .map_err(|_| DepthError::Transport("rosbridge socket task has exited".to_string()))
    }
}

#[async_trait]
impl BrokerTransport for RosbridgeTransport {
    async fn open(&self, uri: &str, hooks: TransportHooks) -> Result<(), DepthError> {
        if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
            return Err(DepthError::Transport(format!(
                "rosbridge URI must use ws:// or wss://, got '{uri}'"
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let previous = self.link.lock().replace(Link {
            outbound: outbound_tx,
            stop: Some(stop_tx),
        });
        if let Some(mut previous) = previous {
            if let Some(stop) = previous.stop.take() {
                let _ = stop.send(());
            }
        }

        tokio::spawn(run_socket(uri.to_string(), hooks, outbound_rx, stop_rx));
        Ok(())
    }

    fn subscribe(&self, topic: &str, type_tag: &str) -> Result<(), DepthError> {
        self.queue(json!({"op": "subscribe", "topic": topic, "type": type_tag}))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), DepthError> {
        self.queue(json!({"op": "unsubscribe", "topic": topic}))
    }

    fn advertise(&self, topic: &str, type_tag: &str) -> Result<(), DepthError> {
        self.queue(json!({"op": "advertise", "topic": topic, "type": type_tag}))
    }

    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), DepthError> {
        let msg: Value =
            serde_json::from_slice(payload).map_err(|e| DepthError::Codec(e.to_string()))?;
        self.queue(json!({"op": "publish", "topic": topic, "msg": msg}))
    }

    fn close(&self) {
        if let Some(mut link) = self.link.lock().take() {
            if let Some(stop) = link.stop.take() {
                let _ = stop.send(());
            }
        }
    }
}

async fn run_socket(
    uri: String,
    hooks: TransportHooks,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut stop: oneshot::Receiver<()>,
) {
    let attempt = tokio::select! {
        result = connect_async(uri.as_str()) => result,
        _ = &mut stop => return,
    };
    let ws_stream = match attempt {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(uri = %uri, error = %e, "Failed to connect to rosbridge");
            (hooks.on_closed)();
            return;
        }
    };
    info!(uri = %uri, "rosbridge socket open");
    (hooks.on_connected)();

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            out = outbound.recv() => {
                match out {
                    Some(msg) => {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(uri = %uri, error = %e, "rosbridge socket error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some((topic, body)) = parse_publish(text.as_str()) {
                            (hooks.on_message)(&topic, &body);
                        }
                    }
                    _ => {}
                }
            }
            _ = &mut stop => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
    info!(uri = %uri, "rosbridge socket closed");
    (hooks.on_closed)();
}

/// Extract `(topic, msg bytes)` from an inbound `publish` op.
///
/// Status messages and other ops are logged and skipped.
fn parse_publish(text: &str) -> Option<(String, Vec<u8>)> {
    let Ok(json) = serde_json::from_str::<Value>(text) else {
        debug!("Ignoring non-JSON rosbridge frame");
        return None;
    };
    let op = json.get("op").and_then(|o| o.as_str()).unwrap_or("");
    if op != "publish" {
        debug!(op, "Ignoring rosbridge op");
        return None;
    }
    let topic = json.get("topic").and_then(|t| t.as_str())?;
    let msg = json.get("msg")?;
    let body = serde_json::to_vec(msg).ok()?;
    Some((topic.to_string(), body))
}
