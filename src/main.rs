//! Landmark streamer CLI application

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use landmark_streamer::camera::TestPatternSource;
use landmark_streamer::config::Config;
use landmark_streamer::landmarks::{Landmark, LandmarkSample};
use landmark_streamer::link::{
    AbortOnDrop, Connector, InboundPayload, MemoryConnector, SupervisorStatus, WebSocketConnector,
};
use landmark_streamer::StreamingSession;

const POSE_LANDMARKS: usize = 33;
const HAND_LANDMARKS: usize = 21;

/// Messages the loopback peer keeps; older ones are discarded
const LOOPBACK_HISTORY: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "landmark-streamer")]
#[command(about = "Stream video frames and landmark batches to classification backends")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Use the in-process loopback transport instead of WebSockets
    #[arg(long)]
    loopback: bool,

    /// Feed generated landmark samples to the batcher
    #[arg(long)]
    synthetic_landmarks: bool,

    /// Statistics reporting interval (seconds)
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Landmark streamer starting");

    let config = match &cli.config {
        Some(path) => {
            info!(config_path = %path, "Loading configuration");
            Config::load(path).with_context(|| format!("failed to load config from {}", path))?
        }
        None => Config::default(),
    };

    info!(
        links = config.links.len(),
        fps = config.video.fps,
        quality = config.video.quality,
        max_retries = config.reconnect.max_retries,
        "Configuration loaded"
    );

    let connector: Arc<dyn Connector> = if cli.loopback {
        Arc::new(MemoryConnector::bounded(LOOPBACK_HISTORY))
    } else {
        Arc::new(WebSocketConnector)
    };
    let source = Arc::new(TestPatternSource::new(
        config.video.max_width,
        config.video.max_height,
    ));

    let session = Arc::new(StreamingSession::new(config, connector, source));
    session.start();

    let _states = session.on_state_change(|event| {
        info!(
            link_id = %event.link_id,
            from = %event.previous,
            to = %event.current,
            reason = event.reason.as_deref().unwrap_or(""),
            "Link state changed"
        );
    });
    let _messages = session.on_message(|message| match message.payload {
        InboundPayload::Json(msg) => {
            info!(link_id = %message.link_id, kind = %msg.kind, "Backend message")
        }
        InboundPayload::Binary(data) => {
            debug!(link_id = %message.link_id, bytes = data.len(), "Backend binary message")
        }
    });

    let mut links = session
        .open_configured_links()
        .context("failed to open configured links")?;
    if links.is_empty() {
        if !cli.loopback {
            info!("No links configured, exiting");
            return Ok(());
        }
        links.push(session.open("mem://loopback").context("failed to open loopback link")?);
    }
    let primary = links[0];

    session
        .streamer()
        .start(primary)
        .context("failed to start frame streaming")?;

    let _feeder = if cli.synthetic_landmarks {
        session
            .batcher()
            .start(primary)
            .context("failed to start landmark batching")?;
        Some(spawn_synthetic_landmarks(Arc::clone(&session)))
    } else {
        None
    };

    let mut supervisor_status = session.supervisor().subscribe_status();
    let mut stats_tick = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(link_id = %primary, "Streaming started, press Ctrl+C to stop");
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl+C")?;
                break;
            }
            _ = stats_tick.tick() => session.log_stats(),
            status = supervisor_status.recv() => match status {
                Ok(status @ SupervisorStatus::Failed { .. }) => {
                    if let Some(err) = status.error() {
                        error!(link_id = %status.link_id(), error = %err, "Link lost permanently");
                    }
                }
                Ok(other) => debug!(status = ?other, "Supervisor status"),
                Err(e) => warn!(error = %e, "Supervisor status channel"),
            },
        }
    }

    info!("Shutting down");
    session.shutdown();
    session.log_stats();
    Ok(())
}

/// Push a slowly swaying skeleton to the batcher at 30 Hz
fn spawn_synthetic_landmarks(session: Arc<StreamingSession>) -> AbortOnDrop {
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(33));
        loop {
            tick.tick().await;
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            session.batcher().push(synthetic_sample(now_ms));
        }
    });
    AbortOnDrop::new(handle, "synthetic-landmarks")
}

fn synthetic_sample(timestamp_ms: u64) -> LandmarkSample {
    let phase = (timestamp_ms % 4000) as f32 / 4000.0 * std::f32::consts::TAU;
    let sway = 0.02 * phase.sin();

    let set = |count: usize, cx: f32, cy: f32, spread: f32| -> Vec<Landmark> {
        (0..count)
            .map(|i| {
                let angle = i as f32 / count as f32 * std::f32::consts::TAU;
                Landmark::new(
                    cx + sway + spread * angle.cos(),
                    cy + spread * angle.sin(),
                    0.0,
                )
            })
            .collect()
    };

    LandmarkSample {
        timestamp_ms,
        pose: set(POSE_LANDMARKS, 0.5, 0.45, 0.2),
        left_hand: set(HAND_LANDMARKS, 0.3, 0.6, 0.04),
        right_hand: set(HAND_LANDMARKS, 0.7, 0.6, 0.04),
    }
}
