//! Multicast streaming client - CLI binary.
//!
//! Finds the server through discovery, receives songs from the multicast
//! group, recovers lost datagrams and caches completed songs on disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use client::{
    ContentCache, DiscoveryClient, DiskSink, DynamicSink, ReceiveContext, ReceiverEvent,
    ServerEvent, SinkKind, StaticSink, StreamReceiver,
};
use wss_common::media::LoggingPlayback;
use wss_common::{
    init_tracing, ColorWhen, Config, EventBus, Id3v1Metadata, MetricsContext, MetricsServerConfig,
    PlaybackSink,
};

/// Multicast audio client - receive and cache songs streamed on the LAN
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disk sink for the song being received: dynamic or static
    #[arg(long, default_value = "dynamic")]
    sink: SinkKind,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
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

    info!("Starting multicast client v{VERSION}");
    info!("Multicast group: {}", config.multicast_addr());
    info!("Cache: {} ({} bytes)", config.cache_dir.display(), config.cache_budget_bytes);
    info!("Sink: {:?}", args.sink);
    info!("Metrics bind: {}", args.metrics_bind);

    let metrics = MetricsContext::new("client")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let server_events = Arc::new(EventBus::new());
    server_events.subscribe(|event: &ServerEvent| match event {
        ServerEvent::Connected(ip) => info!("Streaming from {}", ip),
        ServerEvent::Disconnected(ip) => warn!("Lost server {}", ip),
    });
    let discovery = DiscoveryClient::start(&config, server_events)
        .context("failed to start discovery")?;

    let stream_dir = config.cache_dir.join("stream");
    let sink: Arc<dyn DiskSink> = match args.sink {
        SinkKind::Dynamic => Arc::new(DynamicSink::new(
            &stream_dir,
            &config.cache_prefix,
            &config.cache_suffix,
        )?),
        SinkKind::Static => Arc::new(StaticSink::new(
            &stream_dir.join(format!("current{}", config.cache_suffix)),
        )?),
    };
    let cache = Arc::new(ContentCache::from_config(&config, Some(metrics.clone()))?);

    let receiver_events = Arc::new(EventBus::new());
    let playback = LoggingPlayback;
    receiver_events.subscribe(move |event: &ReceiverEvent| match event {
        ReceiverEvent::StreamStarted { expected_count } => {
            info!("Receiving song of {} datagrams", expected_count)
        }
        ReceiverEvent::StreamRestarted { expected_count } => {
            info!("Song skipped, now receiving {} datagrams", expected_count)
        }
        ReceiverEvent::SongCompleted(handle) => {
            if let Err(e) = playback.play(&handle.path) {
                warn!("Playback failed: {:#}", e);
            }
        }
    });

    let receiver = StreamReceiver::start(
        &config,
        discovery.server(),
        ReceiveContext {
            sink,
            cache,
            events: receiver_events,
            metadata: Arc::new(Id3v1Metadata),
            metrics: Some(metrics.clone()),
        },
    )
    .context("failed to start stream receiver")?;

    info!("Ready to receive songs...");
    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;
    info!("Interrupted");

    receiver.stop().await;
    discovery.stop().await;

    Ok(())
}
