//! [`StreamingSession`] – composition root of the capture pipeline.
//!
//! Each tick runs, in strict sequence on the calling task:
//!
//! 1. **Poll** – take the newest frame from the [`FrameSource`] (latest wins).
//! 2. **Upload** – copy the samples into the raw GPU buffer.
//! 3. **Dispatch** – run the reprojection kernel and obtain a
//!    [`PointBufferHandle`] valid until the next dispatch.
//! 4. **Render** – hand the handle to the [`RenderBackend`].
//! 5. **Publish** – every `publish_every` dispatches, read the points back
//!    and publish them as a `sensor_msgs/PointCloud2` through the
//!    [`BridgeConnector`].
//!
//! Failures inside a tick abort only that tick and are reported on the
//! [`EventBus`] as [`EventPayload::FrameSkipped`].  Failures in
//! [`StreamingSession::start`] are fatal and leave nothing acquired.
//!
//! The broker side runs independently: connecting never blocks a tick, and
//! inbound point clouds are handled on the transport's task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use depthlink_compute::{ComputeConfig, ComputeDispatcher, PointBufferHandle};
use depthlink_hal::FrameSource;
use depthlink_middleware::{BridgeConnector, EventBus};
use depthlink_types::{DepthError, EventPayload, Point3, PointCloudFrame};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::render::RenderBackend;
use crate::watchdog::Watchdog;

const SOURCE: &str = "depthlink-runtime::session";
/// Watchdog component fed by every captured frame.
pub const CAPTURE_COMPONENT: &str = "capture";

/// Completion of a background broker connect.
pub type ConnectTask = JoinHandle<Result<(), DepthError>>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed tick period of [`StreamingSession::run`].
    pub poll_interval: Duration,
    pub compute: ComputeConfig,
    /// Topic point clouds are published on; `None` disables publishing.
    pub publish_topic: Option<String>,
    /// Topic whose point clouds are consumed; `None` disables the subscription.
    pub subscribe_topic: Option<String>,
    /// Publish one cloud every N dispatches; `0` disables publishing.
    pub publish_every: u64,
    /// `frame_id` stamped on published clouds.
    pub frame_id: String,
    /// Points logged after the first dispatch; `0` disables the dump.
    pub diagnostic_points: usize,
    /// Time without a new frame before a `FrameStall` is reported.
    pub stall_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(33),
            compute: ComputeConfig::default(),
            publish_topic: Some("/depthlink/points".to_string()),
            subscribe_topic: None,
            publish_every: 30,
            frame_id: "depth_camera".to_string(),
            diagnostic_points: 10,
            stall_timeout: Duration::from_secs(2),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tick results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No new frame (or the session is not running).
    Idle,
    /// A frame was converted and rendered.
    Dispatched {
        sequence: u64,
        handle: PointBufferHandle,
    },
    /// The tick was abandoned; the session keeps running.
    Skipped(DepthError),
}

/// Running totals, updated every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub skipped: u64,
    pub published: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// StreamingSession
// ─────────────────────────────────────────────────────────────────────────────

pub struct StreamingSession {
    config: SessionConfig,
    source: FrameSource,
    compute: ComputeDispatcher,
    connector: Option<BridgeConnector>,
    renderer: Option<Box<dyn RenderBackend>>,
    bus: EventBus,
    watchdog: Watchdog,
    stats: SessionStats,
    received: Arc<AtomicU64>,
    subscribed: bool,
    diagnostics_pending: bool,
    running: bool,
}

impl StreamingSession {
    pub fn new(
        config: SessionConfig,
        source: FrameSource,
        compute: ComputeDispatcher,
        bus: EventBus,
    ) -> Self {
        let diagnostics_pending = config.diagnostic_points > 0;
        Self {
            config,
            source,
            compute,
            connector: None,
            renderer: None,
            bus,
            watchdog: Watchdog::new(),
            stats: SessionStats::default(),
            received: Arc::new(AtomicU64::new(0)),
            subscribed: false,
            diagnostics_pending,
            running: false,
        }
    }

    /// Attach a broker connector for the publish/subscribe paths.
    pub fn with_connector(mut self, connector: BridgeConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn RenderBackend>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn compute(&self) -> &ComputeDispatcher {
        &self.compute
    }

    pub fn connector(&self) -> Option<&BridgeConnector> {
        self.connector.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Point clouds received on `subscribe_topic` so far.
    pub fn received_clouds(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Acquire the sensor and GPU resources, then start connecting.
    ///
    /// Returns the background connect task when a connector is attached;
    /// awaiting it is optional.  Must be called inside a Tokio runtime when a
    /// connector is attached.
    ///
    /// # Errors
    ///
    /// Sensor and compute failures ([`DepthError::DeviceUnavailable`],
    /// [`DepthError::KernelNotFound`], [`DepthError::AllocationFailed`], a
    /// sensor larger than `max_buffer_size`, ...).  Anything acquired before
    /// the failure is released again.
    pub fn start(&mut self) -> Result<Option<ConnectTask>, DepthError> {
        if self.running {
            return Ok(None);
        }

        let pixel_count = self.source.open()?.pixel_count();
        let prepared = self
            .compute
            .initialize(self.config.compute.clone())
            .and_then(|()| self.compute.ensure_capacity(pixel_count));
        if let Err(e) = prepared {
            warn!(error = %e, "Compute pipeline failed to initialise");
            self.compute.teardown();
            self.source.close();
            return Err(e);
        }

        self.watchdog
            .register(CAPTURE_COMPONENT, self.config.stall_timeout);
        self.running = true;
        info!(
            pixel_count,
            max_buffer_size = self.config.compute.max_buffer_size,
            groups_x = self.config.compute.groups_x(),
            "Streaming session started"
        );

        Ok(self.connector.as_ref().map(|c| c.connect(None, None)))
    }

    /// Run one poll → upload → dispatch → render cycle.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.running {
            return TickOutcome::Idle;
        }
        self.stats.ticks += 1;
        self.ensure_subscription();
        self.report_stalls();

        let Some(frame) = self.source.poll_latest() else {
            return TickOutcome::Idle;
        };
        let sequence = frame.sequence();
        self.watchdog.heartbeat(CAPTURE_COMPONENT);

        if let Err(e) = self.compute.upload(frame) {
            return self.skip(sequence, e);
        }
        let handle = match self.compute.dispatch() {
            Ok(handle) => handle,
            Err(e) => return self.skip(sequence, e),
        };
        self.stats.dispatched += 1;

        if let Some(renderer) = self.renderer.as_mut() {
            renderer.draw_points(&handle, &handle);
        }

        let mut points: Option<Vec<Point3>> = None;
        if self.diagnostics_pending {
            self.diagnostics_pending = false;
            match self.compute.readback(&handle) {
                Ok(read) => {
                    log_points(&read, self.config.diagnostic_points);
                    points = Some(read);
                }
                Err(e) => warn!(error = %e, "Diagnostic readback failed"),
            }
        }
        if self.publish_due() {
            self.publish(sequence, &handle, points);
        }

        TickOutcome::Dispatched { sequence, handle }
    }

    /// Tick every `poll_interval` until `shutdown` is raised, then shut down.
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> SessionStats {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.tick();
        }
        self.shutdown();
        self.stats
    }

    /// Release the broker, GPU and sensor.  Safe to call repeatedly and
    /// after a failed [`start`](Self::start).
    pub fn shutdown(&mut self) {
        if let Some(connector) = &self.connector {
            connector.unsubscribe_from_all();
            match connector.close() {
                Ok(()) | Err(DepthError::AlreadyClosed) => {}
                Err(e) => warn!(error = %e, "Broker close failed"),
            }
        }
        self.subscribed = false;
        self.compute.teardown();
        self.source.close();
        if self.running {
            self.running = false;
            info!(
                ticks = self.stats.ticks,
                dispatched = self.stats.dispatched,
                skipped = self.stats.skipped,
                published = self.stats.published,
                "Streaming session stopped"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn skip(&mut self, sequence: u64, error: DepthError) -> TickOutcome {
        self.stats.skipped += 1;
        warn!(sequence, error = %error, "Skipping frame");
        self.bus.report(
            SOURCE,
            EventPayload::FrameSkipped {
                reason: format!("frame {sequence}: {error}"),
            },
        );
        TickOutcome::Skipped(error)
    }

    fn report_stalls(&mut self) {
        for component in self.watchdog.newly_stalled() {
            warn!(component = %component, timeout = ?self.config.stall_timeout, "No depth frames received");
            self.bus
                .report(SOURCE, EventPayload::FrameStall { component });
        }
    }

    /// Subscribe once the connector reaches `Connected`.
    fn ensure_subscription(&mut self) {
        if self.subscribed {
            return;
        }
        let (Some(connector), Some(topic)) = (&self.connector, &self.config.subscribe_topic)
        else {
            return;
        };
        if !connector.is_connected() {
            return;
        }

        let received = Arc::clone(&self.received);
        let outcome = connector.subscribe_to::<PointCloudFrame, _>(topic, move |cloud| {
            received.fetch_add(1, Ordering::Relaxed);
            debug!(
                seq = cloud.seq,
                frame_id = %cloud.frame_id,
                points = cloud.point_count(),
                "Point cloud received"
            );
            Ok(())
        });
        match outcome {
            Ok(()) => self.subscribed = true,
            Err(DepthError::NotConnected) => {}
            Err(e) => {
                warn!(topic = %topic, error = %e, "Subscription rejected");
                self.subscribed = true;
            }
        }
    }

    fn publish_due(&self) -> bool {
        self.config.publish_topic.is_some()
            && self.config.publish_every > 0
            && self.stats.dispatched % self.config.publish_every == 0
            && self.connector.as_ref().is_some_and(|c| c.is_connected())
    }

    fn publish(&mut self, sequence: u64, handle: &PointBufferHandle, points: Option<Vec<Point3>>) {
        let (Some(connector), Some(topic)) = (&self.connector, &self.config.publish_topic) else {
            return;
        };
        let points = match points {
            Some(points) => points,
            None => match self.compute.readback(handle) {
                Ok(points) => points,
                Err(e) => {
                    warn!(error = %e, "Readback for publish failed");
                    return;
                }
            },
        };
        let cloud = PointCloudFrame::from_points(cloud_seq(sequence), &self.config.frame_id, &points);
        match connector.publish(topic, &cloud) {
            Ok(()) => self.stats.published += 1,
            Err(e) => warn!(topic = %topic, error = %e, "Point cloud publish failed"),
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Header sequence for frame `sequence`; saturates past `u32::MAX`.
fn cloud_seq(sequence: u64) -> u32 {
    u32::try_from(sequence).unwrap_or(u32::MAX)
}

fn log_points(points: &[Point3], limit: usize) {
    for (index, p) in points.iter().take(limit).enumerate() {
        info!(index, x = p.x, y = p.y, z = p.z, "point");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthlink_compute::{ComputeBackend, CpuBackend, PinholeIntrinsics};
    use depthlink_hal::sim::{KINECT_V2_HEIGHT, KINECT_V2_WIDTH};
    use depthlink_hal::{DepthSensor, SensorInfo, SimDepthSensor, SimFeed};
    use depthlink_middleware::{ConnectorConfig, LoopbackTransport};
    use depthlink_compute::{BufferId, BufferKind, KernelId};
    use depthlink_types::DepthFrame;
    use parking_lot::Mutex;

    fn small_config() -> SessionConfig {
        SessionConfig {
            compute: ComputeConfig {
                max_buffer_size: 64,
                num_threads: 4,
                kernel_name: "CSMain".to_string(),
            },
            publish_every: 0,
            diagnostic_points: 0,
            ..SessionConfig::default()
        }
    }

    fn dispatcher(threads: u32) -> ComputeDispatcher {
        let backend =
            CpuBackend::default().with_reprojection_kernel("CSMain", threads, PinholeIntrinsics::default());
        ComputeDispatcher::new(Box::new(backend))
    }

    fn small_session(config: SessionConfig) -> (StreamingSession, SimFeed) {
        let sensor = SimDepthSensor::new("sim", 8, 4);
        let feed = sensor.feed();
        let session = StreamingSession::new(
            config,
            FrameSource::new(Box::new(sensor)),
            dispatcher(4),
            EventBus::default(),
        );
        (session, feed)
    }

    #[derive(Clone, Default)]
    struct CountingRenderer(Arc<Mutex<Vec<usize>>>);

    impl RenderBackend for CountingRenderer {
        fn draw_points(&mut self, vertices: &PointBufferHandle, colors: &PointBufferHandle) {
            assert_eq!(vertices, colors);
            self.0.lock().push(vertices.point_count());
        }
    }

    /// CPU backend that counts host readbacks.
    struct CountingBackend {
        inner: CpuBackend,
        reads: Arc<AtomicU64>,
    }

    impl ComputeBackend for CountingBackend {
        fn find_kernel(&self, name: &str) -> Result<KernelId, DepthError> {
            self.inner.find_kernel(name)
        }

        fn allocate_buffer(
            &mut self,
            element_count: usize,
            element_size: usize,
            kind: BufferKind,
        ) -> Result<BufferId, DepthError> {
            self.inner.allocate_buffer(element_count, element_size, kind)
        }

        fn write_buffer(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<(), DepthError> {
            self.inner.write_buffer(buffer, bytes)
        }

        fn set_buffer(&mut self, kernel: KernelId, slot: &str, buffer: BufferId) -> Result<(), DepthError> {
            self.inner.set_buffer(kernel, slot, buffer)
        }

        fn dispatch(&mut self, kernel: KernelId, groups: [u32; 3]) -> Result<(), DepthError> {
            self.inner.dispatch(kernel, groups)
        }

        fn read_buffer(&self, buffer: BufferId) -> Result<Vec<u8>, DepthError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_buffer(buffer)
        }

        fn release(&mut self, buffer: BufferId) {
            self.inner.release(buffer);
        }

        fn live_buffers(&self) -> usize {
            self.inner.live_buffers()
        }
    }

    fn counting_dispatcher() -> (ComputeDispatcher, Arc<AtomicU64>) {
        let reads = Arc::new(AtomicU64::new(0));
        let backend = CountingBackend {
            inner: CpuBackend::default().with_reprojection_kernel("CSMain", 4, PinholeIntrinsics::default()),
            reads: Arc::clone(&reads),
        };
        (ComputeDispatcher::new(Box::new(backend)), reads)
    }

    /// Reports a small resolution but emits oversized frames.
    struct OversizedSensor;

    impl DepthSensor for OversizedSensor {
        fn open(&mut self) -> Result<SensorInfo, DepthError> {
            Ok(SensorInfo {
                id: "liar".into(),
                width: 4,
                height: 4,
                active: true,
            })
        }

        fn latest_frame(&mut self) -> Option<DepthFrame> {
            DepthFrame::new(16, 16, 1, vec![1000; 256]).ok()
        }

        fn close(&mut self) {}
    }

    #[test]
    fn kinect_frame_end_to_end() -> Result<(), DepthError> {
        let sensor = SimDepthSensor::kinect_v2("kinect");
        let feed = sensor.feed();
        let renderer = CountingRenderer::default();
        let mut session = StreamingSession::new(
            SessionConfig::default(),
            FrameSource::new(Box::new(sensor)),
            dispatcher(64),
            EventBus::default(),
        )
        .with_renderer(Box::new(renderer.clone()));

        assert!(session.start()?.is_none());
        assert_eq!(session.config.compute.groups_x(), 2048);

        feed.push_synthetic(0.0)?;
        let TickOutcome::Dispatched { handle, .. } = session.tick() else {
            panic!("expected a dispatched frame");
        };
        let pixels = (KINECT_V2_WIDTH * KINECT_V2_HEIGHT) as usize;
        let points = session.compute().readback(&handle)?;
        assert_eq!(points.len(), 262_144);
        assert!(points[pixels..].iter().all(|p| *p == Point3::default()));
        assert_eq!(*renderer.0.lock(), vec![262_144]);
        Ok(())
    }

    #[test]
    fn tick_without_new_frame_is_idle() -> Result<(), DepthError> {
        let (mut session, feed) = small_session(small_config());
        session.start()?;

        assert_eq!(session.tick(), TickOutcome::Idle);
        feed.push(vec![500; 32])?;
        assert!(matches!(session.tick(), TickOutcome::Dispatched { sequence: 0, .. }));
        assert_eq!(session.tick(), TickOutcome::Idle);
        assert_eq!(session.stats().dispatched, 1);
        Ok(())
    }

    #[test]
    fn tick_before_start_is_idle() {
        let (mut session, _feed) = small_session(small_config());
        assert_eq!(session.tick(), TickOutcome::Idle);
    }

    #[test]
    fn start_fails_when_sensor_exceeds_buffer() {
        let sensor = SimDepthSensor::new("big", 16, 16);
        let mut session = StreamingSession::new(
            small_config(),
            FrameSource::new(Box::new(sensor)),
            dispatcher(4),
            EventBus::default(),
        );
        assert!(matches!(
            session.start(),
            Err(DepthError::BufferOverflow { .. })
        ));
        assert!(!session.compute().is_initialized());
        assert!(!session.is_running());
    }

    #[test]
    fn start_fails_on_missing_kernel() {
        let mut config = small_config();
        config.compute.kernel_name = "Missing".to_string();
        let (mut session, _feed) = small_session(config);
        assert_eq!(
            session.start().err(),
            Some(DepthError::KernelNotFound("Missing".to_string()))
        );
    }

    #[test]
    fn start_fails_without_sensor() {
        let mut session = StreamingSession::new(
            small_config(),
            FrameSource::new(Box::new(SimDepthSensor::unavailable())),
            dispatcher(4),
            EventBus::default(),
        );
        assert!(matches!(
            session.start(),
            Err(DepthError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn oversized_frame_skips_only_that_tick() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let mut session = StreamingSession::new(
            small_config(),
            FrameSource::new(Box::new(OversizedSensor)),
            dispatcher(4),
            bus,
        );
        session.start()?;

        assert!(matches!(
            session.tick(),
            TickOutcome::Skipped(DepthError::BufferOverflow { .. })
        ));
        assert!(session.is_running());
        assert_eq!(session.stats().skipped, 1);
        assert!(matches!(
            events.try_recv()?.payload,
            EventPayload::FrameSkipped { .. }
        ));
        Ok(())
    }

    #[test]
    fn silent_sensor_reports_one_stall() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = small_config();
        config.stall_timeout = Duration::from_millis(10);
        let (mut session, _feed) = small_session(config);
        let mut events = session.bus().subscribe();
        session.start()?;

        std::thread::sleep(Duration::from_millis(25));
        session.tick();
        session.tick();

        let EventPayload::FrameStall { component } = events.try_recv()?.payload else {
            panic!("expected a stall event");
        };
        assert_eq!(component, CAPTURE_COMPONENT);
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn shutdown_is_idempotent() -> Result<(), DepthError> {
        let (mut session, _feed) = small_session(small_config());
        session.start()?;
        session.shutdown();
        session.shutdown();
        assert!(!session.compute().is_initialized());
        assert_eq!(session.tick(), TickOutcome::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn publishes_and_receives_point_clouds() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LoopbackTransport::new();
        let bus = EventBus::default();
        let connector = BridgeConnector::new(
            ConnectorConfig::default(),
            Arc::new(transport.clone()),
            bus.clone(),
        );
        let mut config = small_config();
        config.publish_every = 2;
        config.subscribe_topic = config.publish_topic.clone();

        let sensor = SimDepthSensor::new("sim", 8, 4);
        let feed = sensor.feed();
        let mut session = StreamingSession::new(
            config,
            FrameSource::new(Box::new(sensor)),
            dispatcher(4),
            bus,
        )
        .with_connector(connector);

        let connect = session.start()?.ok_or("connector attached")?;
        connect.await??;

        for phase in 0..4 {
            feed.push_synthetic(phase as f32)?;
            session.tick();
        }

        assert_eq!(session.stats().published, 2);
        assert_eq!(session.received_clouds(), 2);
        let published = transport.published("/depthlink/points");
        let cloud = <PointCloudFrame as depthlink_middleware::BridgeMessage>::decode(&published[0])?;
        assert_eq!(cloud.point_count(), 64);
        assert_eq!(cloud.frame_id, "depth_camera");
        Ok(())
    }

    #[test]
    fn diagnostic_readback_runs_on_first_dispatch_only() -> Result<(), DepthError> {
        let mut config = small_config();
        config.diagnostic_points = 3;
        let sensor = SimDepthSensor::new("sim", 8, 4);
        let feed = sensor.feed();
        let (compute, reads) = counting_dispatcher();
        let mut session = StreamingSession::new(
            config,
            FrameSource::new(Box::new(sensor)),
            compute,
            EventBus::default(),
        );
        session.start()?;

        for phase in 0..3 {
            feed.push_synthetic(phase as f32)?;
            assert!(matches!(session.tick(), TickOutcome::Dispatched { .. }));
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn first_publish_reuses_diagnostic_points() -> Result<(), Box<dyn std::error::Error>> {
        let transport = LoopbackTransport::new();
        let bus = EventBus::default();
        let connector = BridgeConnector::new(
            ConnectorConfig::default(),
            Arc::new(transport.clone()),
            bus.clone(),
        );
        let mut config = small_config();
        config.diagnostic_points = 3;
        config.publish_every = 1;

        let sensor = SimDepthSensor::new("sim", 8, 4);
        let feed = sensor.feed();
        let (compute, reads) = counting_dispatcher();
        let mut session = StreamingSession::new(config, FrameSource::new(Box::new(sensor)), compute, bus)
            .with_connector(connector);
        session.start()?.ok_or("connector attached")?.await??;

        feed.push_synthetic(0.0)?;
        session.tick();
        assert_eq!(session.stats().published, 1);
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        feed.push_synthetic(1.0)?;
        session.tick();
        assert_eq!(session.stats().published, 2);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(transport.published("/depthlink/points").len(), 2);
        Ok(())
    }

    #[test]
    fn cloud_sequence_saturates() {
        assert_eq!(cloud_seq(7), 7);
        assert_eq!(cloud_seq(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(cloud_seq(u64::from(u32::MAX) + 5), u32::MAX);
    }

    #[tokio::test]
    async fn run_stops_when_flag_is_raised() -> Result<(), Box<dyn std::error::Error>> {
        let mut config = small_config();
        config.poll_interval = Duration::from_millis(1);
        let (mut session, feed) = small_session(config);
        session.start()?;
        feed.push_synthetic(0.0)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let stats = session.run(shutdown).await;
        assert!(stats.ticks > 0);
        assert_eq!(stats.dispatched, 1);
        assert!(!session.is_running());
        Ok(())
    }
}
