//! Topic → handlers table.
//!
//! Each topic carries exactly one message type, fixed by its first
//! registration.  Dispatch decodes the raw payload once and fans the shared
//! message out to every handler in registration order.  A handler that
//! returns an error or panics is reported and skipped; the remaining handlers
//! still run.
//!
//! The table is guarded by a [`parking_lot::RwLock`].  Dispatch holds the
//! read lock only long enough to clone the topic's decoder and handler list,
//! so handlers may themselves register new topics without deadlocking.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use depthlink_types::{DepthError, EventPayload};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::codec::BridgeMessage;

const SOURCE: &str = "depthlink-middleware::registry";

type SharedMessage = Arc<dyn Any + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<SharedMessage, DepthError> + Send + Sync>;
type ErasedHandler = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<(), DepthError> + Send + Sync>;

struct TopicEntry {
    type_tag: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
    handlers: Vec<ErasedHandler>,
}

/// Outcome of one [`TopicRegistry::dispatch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// `false` when nobody had registered the topic; the payload was dropped.
    pub matched: bool,
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// `(handler_index, message)` for every handler that failed or panicked.
    pub failures: Vec<(usize, String)>,
}

#[derive(Default)]
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, TopicEntry>>,
    bus: Option<EventBus>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that reports handler failures on `bus`.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            topics: RwLock::default(),
            bus: Some(bus),
        }
    }

    /// Append `handler` to `topic`'s handler list.
    ///
    /// Returns `true` when this created the topic entry (the caller should
    /// subscribe on the broker), `false` when the topic already existed.
    ///
    /// # Errors
    ///
    /// [`DepthError::TypeConflict`] when the topic is already bound to a
    /// different message type.  The table is left unchanged.
    pub fn register<M, F>(&self, topic: &str, handler: F) -> Result<bool, DepthError>
    where
        M: BridgeMessage,
        F: Fn(&M) -> Result<(), DepthError> + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |msg: &(dyn Any + Send + Sync)| {
            match msg.downcast_ref::<M>() {
                Some(typed) => handler(typed),
                None => Err(DepthError::Codec(format!(
                    "message is not a {}",
                    M::TYPE_TAG
                ))),
            }
        });

        let mut topics = self.topics.write();
        if let Some(entry) = topics.get_mut(topic) {
            if entry.type_id != TypeId::of::<M>() {
                return Err(DepthError::TypeConflict {
                    topic: topic.to_string(),
                    registered: entry.type_tag.to_string(),
                    requested: M::TYPE_TAG.to_string(),
                });
            }
            entry.handlers.push(erased);
            return Ok(false);
        }

        let decode: DecodeFn =
            Arc::new(|raw: &[u8]| M::decode(raw).map(|m| Arc::new(m) as SharedMessage));
        topics.insert(
            topic.to_string(),
            TopicEntry {
                type_tag: M::TYPE_TAG,
                type_id: TypeId::of::<M>(),
                decode,
                handlers: vec![erased],
            },
        );
        Ok(true)
    }

    /// Decode `raw` once and invoke every handler for `topic` in order.
    ///
    /// Unknown topics are dropped silently.
    ///
    /// # Errors
    ///
    /// [`DepthError::Codec`] when the payload does not decode; no handler
    /// runs in that case.
    pub fn dispatch(&self, topic: &str, raw: &[u8]) -> Result<DispatchReport, DepthError> {
        let (decode, handlers) = {
            let topics = self.topics.read();
            match topics.get(topic) {
                Some(entry) => (entry.decode.clone(), entry.handlers.clone()),
                None => {
                    debug!(topic, "Dropping message for unregistered topic");
                    return Ok(DispatchReport::default());
                }
            }
        };

        let message = decode(raw)?;
        let mut report = DispatchReport {
            matched: true,
            ..DispatchReport::default()
        };

        for (index, handler) in handlers.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(message.as_ref())));
            let failure = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(topic, handler_index = index, error = %failure, "Subscription handler failed");
            if let Some(bus) = &self.bus {
                bus.report(
                    SOURCE,
                    EventPayload::HandlerFailed {
                        topic: topic.to_string(),
                        handler_index: index,
                        message: failure.clone(),
                    },
                );
            }
            report.failures.push((index, failure));
        }
        Ok(report)
    }

    /// Remove every topic, returning the names that were registered.
    pub fn clear(&self) -> Vec<String> {
        let mut topics = self.topics.write();
        topics.drain().map(|(topic, _)| topic).collect()
    }

    /// Drop `topic` and all of its handlers.  Returns whether it existed.
    pub fn remove(&self, topic: &str) -> bool {
        self.topics.write().remove(topic).is_some()
    }

    /// `(topic, type_tag)` for every registered topic.
    pub fn topics(&self) -> Vec<(String, &'static str)> {
        self.topics
            .read()
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.type_tag))
            .collect()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |entry| entry.handlers.len())
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextMessage;
    use depthlink_types::{Point3, PointCloudFrame};
    use parking_lot::Mutex;

    fn text(data: &str) -> Vec<u8> {
        format!(r#"{{"data":"{data}"}}"#).into_bytes()
    }

    #[test]
    fn first_registration_creates_topic() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        assert!(registry.register::<TextMessage, _>("/status", |_| Ok(()))?);
        assert!(!registry.register::<TextMessage, _>("/status", |_| Ok(()))?);
        assert_eq!(registry.handler_count("/status"), 2);
        Ok(())
    }

    #[test]
    fn handlers_run_in_registration_order() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            registry.register::<TextMessage, _>("/status", move |msg| {
                seen.lock().push(format!("{label}:{}", msg.data));
                Ok(())
            })?;
        }

        let report = registry.dispatch("/status", &text("m1"))?;
        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock(), vec!["a:m1", "b:m1", "c:m1"]);
        Ok(())
    }

    #[test]
    fn type_conflict_leaves_registry_unchanged() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        registry.register::<PointCloudFrame, _>("/points", |_| Ok(()))?;

        let err = registry
            .register::<TextMessage, _>("/points", |_| Ok(()))
            .unwrap_err();
        assert_eq!(
            err,
            DepthError::TypeConflict {
                topic: "/points".into(),
                registered: "sensor_msgs/PointCloud2".into(),
                requested: "std_msgs/String".into(),
            }
        );
        assert_eq!(registry.handler_count("/points"), 1);
        Ok(())
    }

    #[test]
    fn unknown_topic_is_dropped() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        let report = registry.dispatch("/nobody", &text("x"))?;
        assert!(!report.matched);
        assert_eq!(report.delivered, 0);
        Ok(())
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_the_rest() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let registry = TopicRegistry::with_bus(bus);
        let reached = Arc::new(Mutex::new(false));

        registry.register::<TextMessage, _>("/status", |_| {
            Err(DepthError::HandlerFailed("rejected".into()))
        })?;
        registry.register::<TextMessage, _>("/status", |_| panic!("boom"))?;
        let flag = Arc::clone(&reached);
        registry.register::<TextMessage, _>("/status", move |_| {
            *flag.lock() = true;
            Ok(())
        })?;

        let report = registry.dispatch("/status", &text("x"))?;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].0, 0);
        assert!(report.failures[1].1.contains("boom"));
        assert!(*reached.lock());

        let first = events.try_recv()?;
        assert!(matches!(
            first.payload,
            EventPayload::HandlerFailed { handler_index: 0, .. }
        ));
        Ok(())
    }

    #[test]
    fn undecodable_payload_runs_no_handler() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        registry.register::<PointCloudFrame, _>("/points", move |_| {
            *counter.lock() += 1;
            Ok(())
        })?;

        assert!(matches!(
            registry.dispatch("/points", b"{}"),
            Err(DepthError::Codec(_))
        ));
        assert_eq!(*calls.lock(), 0);
        Ok(())
    }

    #[test]
    fn handlers_share_one_decoded_frame() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        let counts = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let counts = Arc::clone(&counts);
            registry.register::<PointCloudFrame, _>("/points", move |frame| {
                counts.lock().push(frame.point_count());
                Ok(())
            })?;
        }
        let frame = PointCloudFrame::from_points(1, "cam", &[Point3::new(0.0, 0.0, 1.0); 5]);
        registry.dispatch("/points", &frame.encode()?)?;
        assert_eq!(*counts.lock(), vec![5, 5]);
        Ok(())
    }

    #[test]
    fn handler_may_register_during_dispatch() -> Result<(), DepthError> {
        let registry = Arc::new(TopicRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register::<TextMessage, _>("/status", move |_| {
            inner.register::<TextMessage, _>("/late", |_| Ok(())).map(|_| ())
        })?;
        registry.dispatch("/status", &text("x"))?;
        assert_eq!(registry.handler_count("/late"), 1);
        Ok(())
    }

    #[test]
    fn clear_returns_registered_topics() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        registry.register::<TextMessage, _>("/a", |_| Ok(()))?;
        registry.register::<TextMessage, _>("/b", |_| Ok(()))?;

        let mut cleared = registry.clear();
        cleared.sort();
        assert_eq!(cleared, vec!["/a", "/b"]);
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn remove_drops_topic_and_allows_fresh_registration() -> Result<(), DepthError> {
        let registry = TopicRegistry::new();
        registry.register::<TextMessage, _>("/status", |_| Ok(()))?;

        assert!(registry.remove("/status"));
        assert!(!registry.remove("/status"));
        assert!(!registry.dispatch("/status", &text("x"))?.matched);
        assert!(registry.register::<TextMessage, _>("/status", |_| Ok(()))?);
        Ok(())
    }
}
