//! [`Watchdog`] – stall detection for the capture loop.
//!
//! Components call [`Watchdog::heartbeat`] whenever they make progress.  A
//! component whose last heartbeat is older than its timeout is *stalled*.
//! [`Watchdog::newly_stalled`] reports each stall once; the next heartbeat
//! re-arms it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    Stalled,
}

struct ComponentEntry {
    last_heartbeat: Instant,
    timeout: Duration,
    reported: bool,
}

impl ComponentEntry {
    fn is_stalled(&self) -> bool {
        self.last_heartbeat.elapsed() > self.timeout
    }
}

/// Tracks heartbeats from registered components.
///
/// ```
/// use std::time::Duration;
/// use depthlink_runtime::watchdog::{ComponentHealth, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("capture", Duration::from_secs(2));
/// wd.heartbeat("capture");
/// assert_eq!(wd.health("capture"), ComponentHealth::Healthy);
/// ```
#[derive(Default)]
pub struct Watchdog {
    components: HashMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `component` with the given `timeout`, counting from
    /// now.  Re-registering resets the deadline.
    pub fn register(&mut self, component: &str, timeout: Duration) {
        self.components.insert(
            component.to_string(),
            ComponentEntry {
                last_heartbeat: Instant::now(),
                timeout,
                reported: false,
            },
        );
    }

    /// Record progress.  No-op for unregistered components.
    pub fn heartbeat(&mut self, component: &str) {
        if let Some(entry) = self.components.get_mut(component) {
            entry.last_heartbeat = Instant::now();
            entry.reported = false;
        }
    }

    /// Unknown components are reported as stalled.
    pub fn health(&self, component: &str) -> ComponentHealth {
        match self.components.get(component) {
            Some(entry) if !entry.is_stalled() => ComponentHealth::Healthy,
            _ => ComponentHealth::Stalled,
        }
    }

    /// Components that stalled since the last call, each reported once per
    /// stall.  Order is unspecified.
    pub fn newly_stalled(&mut self) -> Vec<String> {
        self.components
            .iter_mut()
            .filter(|(_, entry)| !entry.reported && entry.is_stalled())
            .map(|(id, entry)| {
                entry.reported = true;
                id.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_component_is_healthy() {
        let mut wd = Watchdog::new();
        wd.register("capture", Duration::from_secs(5));
        assert_eq!(wd.health("capture"), ComponentHealth::Healthy);
        assert!(wd.newly_stalled().is_empty());
    }

    #[test]
    fn heartbeat_resets_deadline() {
        let mut wd = Watchdog::new();
        wd.register("capture", Duration::from_millis(300));
        thread::sleep(Duration::from_millis(200));
        wd.heartbeat("capture");
        thread::sleep(Duration::from_millis(200));
        assert_eq!(wd.health("capture"), ComponentHealth::Healthy);
    }

    #[test]
    fn stall_is_reported_once_until_next_heartbeat() {
        let mut wd = Watchdog::new();
        wd.register("capture", Duration::from_millis(10));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(wd.health("capture"), ComponentHealth::Stalled);
        assert_eq!(wd.newly_stalled(), vec!["capture".to_string()]);
        assert!(wd.newly_stalled().is_empty());

        wd.heartbeat("capture");
        thread::sleep(Duration::from_millis(20));
        assert_eq!(wd.newly_stalled(), vec!["capture".to_string()]);
    }

    #[test]
    fn unknown_component_is_stalled() {
        let wd = Watchdog::new();
        assert_eq!(wd.health("ghost"), ComponentHealth::Stalled);
    }
}
