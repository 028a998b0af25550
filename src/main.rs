use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod aggregator;
mod clients;
mod config;
mod config_store;
mod connection_manager;
mod coordinator;
mod database;
mod detection;
mod errors;
mod events;
mod frame_source;
mod gateway;
mod kiosk;
mod lane;
mod matcher_pool;
mod mqtt;
mod onvif;
mod orchestrator;
mod prober;
mod recognition;
mod recording;
mod segments;
mod transcoder;
mod utils;
mod vision;

use config::Config;
use config_store::ConfigStore;
use coordinator::{Coordinator, CoordinatorParts};
use database::{DatabaseProvider, SqliteDatabase};
use events::EventBus;
use gateway::VideoGateway;
use mqtt::MqttPublisher;
use onvif::OnvifConnector;
use prober::DeviceProber;
use vision::{DisabledVision, FaceDetector, FaceEmbedder, VisionClient};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lane camera and kiosk edge backend")]
struct Args {
    /// Bootstrap configuration file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "lane_edge=debug,info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the edge daemon (default)
    Run,
    /// Discover cameras once and print the candidates as JSON
    Probe,
    /// Turn a recorder silencedetect log into sound segments
    Segments {
        /// File holding ffmpeg silencedetect output
        log: PathBuf,
        /// Recording duration in seconds
        #[arg(long)]
        duration: f64,
        /// Padding added around each sound segment, in seconds
        #[arg(long, default_value = "1.0")]
        delta: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = Config::load(&args.config)
                .with_context(|| format!("loading {}", args.config))?;
            run_daemon(config).await
        }
        Command::Probe => {
            let config = Config::load(&args.config)
                .with_context(|| format!("loading {}", args.config))?;
            let candidates = DeviceProber::new(config.network).discover().await?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
            Ok(())
        }
        Command::Segments { log, duration, delta } => print_segments(&log, duration, delta).await,
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    info!("Starting lane edge backend");

    let media_root = config.media_root();
    tokio::fs::create_dir_all(&media_root).await
        .with_context(|| format!("creating media root {}", media_root.display()))?;
    if let Some(parent) = Path::new(&config.server.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let sqlite = SqliteDatabase::new(&config.server.database_path).await?;
    sqlite.initialize().await?;
    let database: Arc<dyn DatabaseProvider> = Arc::new(sqlite);
    info!("Database ready at {}", config.server.database_path);

    let store = ConfigStore::new(Arc::clone(&database));
    store.seed_defaults(&config.default_entries()).await?;

    let bus = EventBus::new(256);

    let mqtt = match &config.mqtt {
        Some(mqtt_config) if mqtt_config.enabled => match MqttPublisher::new(mqtt_config.clone()).await {
            Ok(publisher) => Some(publisher.start(&bus).await?),
            Err(e) => {
                error!("MQTT disabled: {}", e);
                None
            }
        },
        _ => None,
    };
    let (status, remote_commands) = match mqtt {
        Some((handle, commands)) => (Some(handle), Some(commands)),
        None => (None, None),
    };

    let (detector, embedder): (Arc<dyn FaceDetector>, Arc<dyn FaceEmbedder>) = match &config.vision {
        Some(vision_config) => {
            let client = Arc::new(VisionClient::new(vision_config)?);
            info!("Using vision service at {}", vision_config.base_url);
            let detector: Arc<dyn FaceDetector> = client.clone();
            let embedder: Arc<dyn FaceEmbedder> = client;
            (detector, embedder)
        }
        None => {
            warn!("No [vision] section configured, face detection and recognition are disabled");
            let detector: Arc<dyn FaceDetector> = Arc::new(DisabledVision);
            let embedder: Arc<dyn FaceEmbedder> = Arc::new(DisabledVision);
            (detector, embedder)
        }
    };

    let gateway = config.gateway.as_ref().map(VideoGateway::new).transpose()?;
    let connector = Arc::new(OnvifConnector::new(config.network.probe_timeout()));

    let parts = CoordinatorParts {
        database,
        store,
        bus,
        connector,
        detector,
        embedder,
        gateway,
        status,
    };
    let replies = parts.status.clone();
    let (coordinator, handle) = Coordinator::new(&config, parts).await?;
    let mut task = tokio::spawn(coordinator.run());

    if let (Some(commands), Some(replies)) = (remote_commands, replies) {
        tokio::spawn(coordinator::serve_commands(handle.clone(), commands, replies));
        info!("Accepting administrative commands over MQTT");
    }

    tokio::select! {
        result = &mut task => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }

    handle.shutdown().await;
    task.await??;
    info!("Stopped");
    Ok(())
}

async fn print_segments(log: &Path, duration: f64, delta: f64) -> Result<()> {
    if !duration.is_finite() || duration < 0.0 {
        anyhow::bail!("--duration must be a non-negative number of seconds, got {}", duration);
    }
    if !delta.is_finite() || delta < 0.0 {
        anyhow::bail!("--delta must be a non-negative number of seconds, got {}", delta);
    }
    let file = tokio::fs::File::open(log).await
        .with_context(|| format!("opening {}", log.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut tracker = segments::SilenceTracker::default();
    while let Some(line) = lines.next_line().await? {
        tracker.feed_line(&line);
    }

    let silence = tracker.finish(duration);
    let sound = segments::invert_segments(&silence, duration);
    let report = serde_json::json!({
        "duration": duration,
        "silence": silence,
        "sound": sound,
        "shots": segments::shot_timestamps(&sound),
        "clips": segments::extend_and_merge_segments(&sound, delta, duration),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_segments_rejects_unusable_duration() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("silence.log");
        tokio::fs::write(&log, "[silencedetect @ 0x1] silence_start: 2\n").await.unwrap();

        assert!(print_segments(&log, -1.0, 1.0).await.is_err());
        assert!(print_segments(&log, f64::NAN, 1.0).await.is_err());
        assert!(print_segments(&log, 10.0, f64::INFINITY).await.is_err());
        assert!(print_segments(&log, 10.0, 1.0).await.is_ok());
    }
}
