//! `depthlink-cli` – depth streaming daemon.
//!
//! This binary:
//!
//! 1. Loads `~/.depthlink/config.toml`, writing the defaults on first run.
//! 2. Feeds a simulated Kinect v2 depth sensor with synthetic frames.
//! 3. Runs the [`StreamingSession`] tick loop: depth frames are reprojected
//!    into point clouds and periodically published to a rosbridge broker.
//! 4. Intercepts **Ctrl-C** to stop the loop and release sensor, GPU and
//!    broker resources in order.

mod config;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use depthlink_compute::{ComputeDispatcher, CpuBackend, PinholeIntrinsics};
use depthlink_hal::{FrameSource, SimDepthSensor, SimFeed};
use depthlink_middleware::{BridgeConnector, EventBus, RosbridgeTransport};
use depthlink_runtime::{NullRenderer, SessionStats, StreamingSession, init_tracing};
use depthlink_types::{DepthError, EventPayload};

fn main() {
    // Spans go to OTLP when OTEL_EXPORTER_OTLP_ENDPOINT is set.  User-facing
    // output still uses println!.
    let _tracing = init_tracing("depthlink");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the stream …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_default_config(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start Tokio runtime".red(), e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(stream(cfg, shutdown)) {
        Ok(stats) => {
            println!(
                "\n  {} {} frames dispatched, {} skipped, {} clouds published",
                "✓".green().bold(),
                stats.dispatched,
                stats.skipped,
                stats.published
            );
        }
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn stream(cfg: config::Config, shutdown: Arc<AtomicBool>) -> Result<SessionStats, DepthError> {
    let session_config = cfg.session_config();
    let bus = EventBus::default();
    tokio::spawn(print_events(bus.clone()));

    let sensor = SimDepthSensor::kinect_v2("sim-kinect-v2");
    tokio::spawn(feed_synthetic(
        sensor.feed(),
        session_config.poll_interval,
        Arc::clone(&shutdown),
    ));

    let backend = CpuBackend::default().with_reprojection_kernel(
        cfg.kernel_name.as_str(),
        cfg.num_threads,
        PinholeIntrinsics::default(),
    );

    let mut session = StreamingSession::new(
        session_config,
        FrameSource::new(Box::new(sensor)),
        ComputeDispatcher::new(Box::new(backend)),
        bus.clone(),
    )
    .with_renderer(Box::new(NullRenderer::default()));

    if cfg.broker_enabled {
        let connector = BridgeConnector::new(
            cfg.connector_config(),
            Arc::new(RosbridgeTransport::new()),
            bus,
        );
        session = session.with_connector(connector);
    }

    // The connect task is left detached; its outcome arrives on the bus.
    let _connecting = session.start()?;
    println!(
        "  Streaming {} → {}   (Ctrl-C to stop)\n",
        "sim-kinect-v2".bold(),
        if cfg.broker_enabled {
            cfg.broker_uri().to_string().bold().to_string()
        } else {
            "broker disabled".dimmed().to_string()
        }
    );

    Ok(session.run(shutdown).await)
}

/// Push a fresh synthetic frame every `interval` until shutdown.
async fn feed_synthetic(feed: SimFeed, interval: Duration, shutdown: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval(interval);
    let mut phase = 0.0_f32;
    while !shutdown.load(Ordering::SeqCst) {
        ticker.tick().await;
        if let Err(e) = feed.push_synthetic(phase) {
            warn!(error = %e, "Synthetic frame rejected");
            return;
        }
        phase += 0.1;
    }
}

/// Echo reporting-bus events to the terminal.
async fn print_events(bus: EventBus) {
    let mut rx = bus.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };
        match event.payload {
            EventPayload::Connected { uri } => {
                println!("  {} connected to {}", "●".green(), uri.bold());
            }
            EventPayload::Closed { uri } => {
                println!("  {} disconnected from {}", "●".dimmed(), uri);
            }
            EventPayload::ConnectTimeout { uri, timeout_ms } => {
                println!(
                    "  {} no answer from {} within {} ms, still trying",
                    "●".yellow(),
                    uri,
                    timeout_ms
                );
            }
            EventPayload::FrameStall { component } => {
                println!("  {} {} stalled", "●".yellow(), component);
            }
            // Per-frame and per-handler failures are already in the log.
            EventPayload::FrameSkipped { .. } | EventPayload::HandlerFailed { .. } => {}
        }
    }
}

fn write_default_config() -> config::Config {
    let mut cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"       __          __  __    ___       __  "#.bold().cyan());
    println!("{}", r#"  ____/ /__ ___   / /_/ /   / (_)__   / /__"#.bold().cyan());
    println!("{}", r#" / __  / -_) _ \ / __/ _ \ / / / _ \ /  '_/"#.bold().cyan());
    println!("{}", r#" \_,_/\__/ .__/ \__/_//_//_/_/_//_//_/\_\ "#.bold().cyan());
    println!("{}", r#"        /_/                               "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "depthlink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Depth camera → point cloud → rosbridge");
    println!();
}
