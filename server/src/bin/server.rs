//! Multicast streaming server - CLI binary.
//!
//! Announces itself on the LAN, streams the given audio files to the
//! multicast group and serves missing datagrams over the recovery channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use server::{
    stream_song, CurrentSong, DiscoveryEvent, DiscoveryServer, MulticastSender, PeerRegistry,
    RecoveryServer,
};
use wss_common::media::FileNameMetadata;
use wss_common::{
    init_tracing, ColorWhen, Config, EventBus, MetadataReader, MetricsContext,
    MetricsServerConfig,
};

/// Multicast audio server - stream songs to every client on the LAN
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Audio files to stream, in order
    #[arg(short, long, required = true, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Replay the playlist continuously (default). Use `--no-loop` to play once and exit.
    #[arg(long = "no-loop", default_value_t = true, action = clap::ArgAction::SetFalse)]
    loop_playlist: bool,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9100")]
    metrics_bind: String,

    /// Coloring: auto, always or never
    #[arg(long, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color)?;

    let config = Config::load(args.config.as_deref())?;

    info!("Starting multicast server v{VERSION}");
    info!("Playlist: {} file(s)", args.input.len());
    info!("Multicast group: {}", config.multicast_addr());
    info!("Recovery port: {}", config.recovery_port);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("server")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let registry = Arc::new(PeerRegistry::new());
    let events = Arc::new(EventBus::new());
    events.subscribe(|event: &DiscoveryEvent| match event {
        DiscoveryEvent::PeerJoined(peer) => info!("Client connected: {}", peer.address),
        DiscoveryEvent::PeerExpired(peer) => info!("Client gone: {}", peer.display_name),
    });

    let discovery =
        DiscoveryServer::start(&config, Arc::clone(&registry), events, Some(metrics.clone()))
            .await
            .context("failed to start discovery")?;

    let current = CurrentSong::new();
    let recovery = RecoveryServer::start(&config, current.clone(), Some(metrics.clone()))
        .await
        .context("failed to start recovery channel")?;

    let mut sender =
        MulticastSender::new(config.multicast_addr()).context("failed to create sender")?;

    tokio::select! {
        res = play(&args, &config, &mut sender, &current, &metrics) => {
            match res {
                Ok(()) => info!("Playlist finished, serving recovery until interrupted"),
                Err(e) => warn!("Playlist ended with error: {:#}", e),
            }
            let _ = tokio::signal::ctrl_c().await;
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    recovery.stop().await;
    discovery.stop().await;

    let (packets, bytes) = sender.stats();
    info!("Transmission complete: {} packets, {} bytes", packets, bytes);

    Ok(())
}

async fn play(
    args: &Args,
    config: &Config,
    sender: &mut MulticastSender,
    current: &CurrentSong,
    metrics: &MetricsContext,
) -> Result<()> {
    // ---
    let reader = FileNameMetadata;

    loop {
        let mut streamed = 0;
        for path in &args.input {
            let song = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let meta = reader.read(path)?;
            info!("Now streaming: {} - {}", meta.artist, meta.title);

            stream_song(&song, sender, current, config.send_interval(), Some(metrics)).await?;
            streamed += 1;
        }

        if streamed == 0 {
            anyhow::bail!("no playable input files");
        }
        if !args.loop_playlist {
            return Ok(());
        }
    }
}
