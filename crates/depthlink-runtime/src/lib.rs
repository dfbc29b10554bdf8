//! `depthlink-runtime` – Streaming session and process plumbing.
//!
//! # Modules
//!
//! - [`session`] – [`StreamingSession`]: the composition root.  Drives the
//!   fixed-tick poll → upload → dispatch → render loop, the periodic point
//!   cloud publish, and ordered shutdown of sensor, compute and broker.
//! - [`render`] – [`RenderBackend`]: the renderer seam, plus the headless
//!   [`NullRenderer`].
//! - [`watchdog`] – [`Watchdog`]: reports a capture loop that stopped
//!   receiving frames.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.  Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to ship spans to Jaeger, Grafana Tempo, or
//!   any OTLP-compatible collector.

pub mod render;
pub mod session;
pub mod telemetry;
pub mod watchdog;

pub use render::{NullRenderer, RenderBackend};
pub use session::{ConnectTask, SessionConfig, SessionStats, StreamingSession, TickOutcome};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
pub use watchdog::{ComponentHealth, Watchdog};
