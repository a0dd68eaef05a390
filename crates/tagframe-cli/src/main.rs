//! `tagframe-cli` – the `tagframe` binary.
//!
//! 1. Loads `tagframe.toml` (or `--config`), falling back to defaults.
//! 2. Builds the tag catalog, the frame graph seeded with the configured
//!    static relationships, and a [`TagDetectorNode`] on a fresh event bus.
//! 3. Runs one of:
//!    * `run` – live mode over rosbridge, either listening for clients or
//!      dialing a `rosbridge_server`;
//!    * `replay` – feeds a recorded session through the pipeline and prints
//!      one JSON line per frame;
//!    * `init` – writes a default configuration file.
//! 4. Intercepts **Ctrl-C** and stops the node cleanly.

mod config;
mod replay;

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use config::NodeConfig;
use tagframe_middleware::{EventBus, Ros2Adapter, Ros2Bridge, Topic};
use tagframe_perception::{SharedTfEngine, TagDetector};
use tagframe_runtime::{FrameOutcome, TagDetectorNode, init_tracing};
use tagframe_types::{EventPayload, TagDetectionArray};

#[derive(Parser)]
#[command(name = "tagframe")]
#[command(about = "Turn fiducial marker detections into metric poses and frame relationships")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./tagframe.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run live against rosbridge.
    Run {
        /// Dial this rosbridge server instead of listening for clients.
        #[arg(long)]
        connect: Option<String>,

        /// Listen address for server mode (overrides `listen_addr`).
        #[arg(long)]
        listen: Option<String>,

        /// Recording whose detection batches stand in for a pixel decoder.
        #[arg(long)]
        detections: Option<PathBuf>,
    },

    /// Replay a recorded session (JSON lines) and print the detections.
    Replay {
        /// Path to the recording.
        recording: PathBuf,
    },

    /// Write the default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let _guard = init_tracing("tagframe");
    let cli = Cli::parse();
    let config_path = config::resolve_path(cli.config);

    if let Commands::Init { force } = cli.command {
        return match init_config(&config_path, force) {
            Ok(()) => {
                info!(path = %config_path.display(), "config written");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "init failed");
                ExitCode::FAILURE
            }
        };
    }

    let cfg = match config::load_from(&config_path) {
        Ok(Some(cfg)) => {
            info!(path = %config_path.display(), "config loaded");
            cfg
        }
        Ok(None) => {
            warn!(path = %config_path.display(), "no config file; using defaults");
            let mut cfg = NodeConfig::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            error!(error = %e, "config error");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Run {
            connect,
            listen,
            detections,
        } => run_live(cfg, connect, listen, detections),
        Commands::Replay { recording } => replay::load(&recording).and_then(|records| {
            let stdout = std::io::stdout();
            replay_session(&cfg, records, &mut stdout.lock()).map(|summary| {
                info!(
                    frames = summary.frames,
                    published = summary.published,
                    detections = summary.detections,
                    "replay finished"
                );
            })
        }),
        Commands::Init { .. } => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tagframe failed");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node assembly
// ─────────────────────────────────────────────────────────────────────────────

/// Build the node on `bus`.  The returned frame graph answers the node's
/// lookups and receives every tag frame it broadcasts.
fn build_node(
    cfg: &NodeConfig,
    detector: Box<dyn TagDetector>,
    bus: Arc<EventBus>,
) -> (TagDetectorNode, SharedTfEngine) {
    let frames = SharedTfEngine::new(cfg.frame_graph());
    let node = TagDetectorNode::new(
        cfg.catalog(),
        cfg.node_config(),
        detector,
        Arc::new(frames.clone()),
        bus,
    )
    .with_broadcaster(Arc::new(frames.clone()));
    (node, frames)
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    frames: usize,
    published: usize,
    detections: usize,
}

/// Push every recorded frame through the pipeline, enabled, and write one
/// JSON line per published frame to `out`.
fn replay_session(
    cfg: &NodeConfig,
    records: Vec<replay::ReplayRecord>,
    out: &mut impl Write,
) -> Result<ReplaySummary, String> {
    let (detector, frames) = replay::into_session(cfg.family(), records);
    let bus = Arc::new(EventBus::new(cfg.bus_capacity));
    let mut detections_rx = bus.subscribe_to(Topic::Detections);
    let (mut node, _frames) = build_node(cfg, Box::new(detector), Arc::clone(&bus));
    node.set_enabled(true);

    let mut summary = ReplaySummary::default();
    for frame in &frames {
        summary.frames += 1;
        let FrameOutcome::Published { detections } = node.handle_frame(frame) else {
            continue;
        };
        summary.published += 1;
        summary.detections += detections;

        let array = match detections_rx.try_recv() {
            Ok(event) => match event.payload {
                EventPayload::Detections(array) => array,
                _ => TagDetectionArray::default(),
            },
            Err(e) => return Err(format!("detections not published: {e}")),
        };
        let line = json!({
            "stamp": frame.image.header.stamp,
            "detections": array.detections,
        });
        writeln!(out, "{line}").map_err(|e| format!("Failed to write output: {e}"))?;
    }
    Ok(summary)
}

// ─────────────────────────────────────────────────────────────────────────────
// Live mode
// ─────────────────────────────────────────────────────────────────────────────

fn run_live(
    cfg: NodeConfig,
    connect: Option<String>,
    listen: Option<String>,
    detections: Option<PathBuf>,
) -> Result<(), String> {
    let detector: Box<dyn TagDetector> = {
        let records = match &detections {
            Some(path) => replay::load(path)?,
            None => {
                warn!("no detection source configured; every frame will report zero markers");
                Vec::new()
            }
        };
        Box::new(replay::into_session(cfg.family(), records).0)
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl-C received; shutting down");
        shutdown_clone.store(true, Ordering::Release);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    // The runtime is created after `init_tracing` so the span exporter never
    // depends on it.
    let runtime =
        tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start runtime: {e}"))?;

    let outcome: Result<(), String> = runtime.block_on(async move {
        let bus = Arc::new(EventBus::new(cfg.bus_capacity));
        let (node, _frames) = build_node(&cfg, detector, Arc::clone(&bus));

        let adapter = Arc::new(Ros2Adapter::new(Arc::clone(&bus)));
        let bridge = Ros2Bridge::new(Arc::clone(&bus), adapter);
        let transport = match connect.or(cfg.rosbridge_url.clone()) {
            Some(url) => tokio::spawn(async move { bridge.connect(&url).await }),
            None => {
                let raw = listen.unwrap_or_else(|| cfg.listen_addr.clone());
                let addr: SocketAddr = raw
                    .parse()
                    .map_err(|e| format!("Invalid listen address '{raw}': {e}"))?;
                tokio::spawn(bridge.run_ws_server(addr))
            }
        };

        let node_task = tokio::spawn(node.run(Arc::clone(&shutdown)));

        while !shutdown.load(Ordering::Acquire) {
            if transport.is_finished() {
                shutdown.store(true, Ordering::Release);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let transport_result = if transport.is_finished() {
            transport.await.map_err(|e| format!("transport task failed: {e}"))?
        } else {
            transport.abort();
            Ok(())
        };
        node_task
            .await
            .map_err(|e| format!("detector task failed: {e}"))?;
        transport_result.map_err(|e| e.to_string())
    });
    outcome
}

// ─────────────────────────────────────────────────────────────────────────────
// Init
// ─────────────────────────────────────────────────────────────────────────────

fn init_config(path: &std::path::Path, force: bool) -> Result<(), String> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        ));
    }
    config::save_to(&NodeConfig::default(), path)
}
