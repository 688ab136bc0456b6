//! Streaming client library.
//!
//! Joins the multicast stream, reassembles songs, fills gaps over the
//! recovery channel and persists completed songs to the disk cache.

pub mod cache;
pub mod discovery;
pub mod machine;
pub mod network;
pub mod recovery;
pub mod stats;

pub use cache::{
    CacheError, CacheHandle, ContentCache, DiskSink, DynamicSink, SinkKind, StaticSink,
};
pub use discovery::{DiscoveryClient, ServerEvent, ServerPorts, ServerTracker};
pub use machine::{CompletedSong, Outcome, ReceiverMachine, ReceiverState};
pub use network::MulticastReceiver;
pub use recovery::{RecoveredBatch, RecoveryClient, RecoveryHandle, RecoveryRequest};
pub use stats::ReceiverStats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wss_common::{
    Config, EventBus, MetadataReader, MetricsContext, StopSignal, TrackMetadata, Worker,
};

/// Recovered batches waiting for the receive loop.
const RECOVERED_QUEUE_DEPTH: usize = 16;

/// Notifications fired by the stream receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    StreamStarted { expected_count: u32 },
    StreamRestarted { expected_count: u32 },
    SongCompleted(CacheHandle),
}

/// Collaborators of the receive loop.
#[derive(Clone)]
pub struct ReceiveContext {
    // ---
    pub sink: Arc<dyn DiskSink>,
    pub cache: Arc<ContentCache>,
    pub events: Arc<EventBus<ReceiverEvent>>,

    /// Tags completed songs once they are on disk
    pub metadata: Arc<dyn MetadataReader>,
    pub metrics: Option<MetricsContext>,
}

/// Limits and timing of the receive loop.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverSettings {
    // ---
    /// Largest datagram count an init may announce
    pub max_expected_count: u32,

    /// Bounded receive wait; each expiry while receiving runs a gap check
    pub read_timeout: Duration,

    /// Bounded join when stopping
    pub stop_timeout: Duration,
}

impl ReceiverSettings {
    pub fn from_config(config: &Config) -> Self {
        // ---
        Self {
            max_expected_count: config.max_expected_count(),
            read_timeout: config.read_timeout(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

/// Running stream receiver and its recovery client.
pub struct StreamReceiver {
    // ---
    worker: Worker,
    recovery: RecoveryClient,
    stop_timeout: Duration,
}

impl StreamReceiver {
    // ---
    /// Joins the configured multicast group and starts receiving.
    ///
    /// # Arguments
    ///
    /// * `config` - Runtime configuration
    /// * `server` - Recovery endpoint of the current server
    /// * `ctx` - Sink, cache, events and metrics
    ///
    /// # Errors
    ///
    /// Returns error if the multicast group cannot be joined.
    pub fn start(
        config: &Config,
        server: watch::Receiver<Option<SocketAddr>>,
        ctx: ReceiveContext,
    ) -> Result<Self> {
        // ---
        let socket = MulticastReceiver::join(config.multicast_addr())?;
        Ok(Self::with_socket(
            socket,
            server,
            ctx,
            ReceiverSettings::from_config(config),
        ))
    }

    /// Starts receiving on an already-bound socket.
    pub fn with_socket(
        socket: MulticastReceiver,
        server: watch::Receiver<Option<SocketAddr>>,
        ctx: ReceiveContext,
        settings: ReceiverSettings,
    ) -> Self {
        // ---
        let (recovered_tx, recovered_rx) = mpsc::channel(RECOVERED_QUEUE_DEPTH);
        let recovery = RecoveryClient::start(
            server,
            recovered_tx,
            settings.read_timeout,
            settings.stop_timeout,
            ctx.metrics.clone(),
        );

        let pipeline = ReceivePipeline::new(
            ReceiverMachine::new(settings.max_expected_count),
            ctx,
            recovery.handle(),
        );

        let signal = StopSignal::new();
        let worker = Worker::spawn(
            "stream-receiver",
            signal.clone(),
            receive_loop(socket, pipeline, recovered_rx, settings.read_timeout, signal),
        );

        Self {
            worker,
            recovery,
            stop_timeout: settings.stop_timeout,
        }
    }

    /// Stops the receive loop, then the recovery client.
    pub async fn stop(self) {
        // ---
        self.worker.stop(self.stop_timeout).await;
        self.recovery.stop().await;
        info!("Stream receiver stopped");
    }
}

async fn receive_loop(
    mut socket: MulticastReceiver,
    mut pipeline: ReceivePipeline,
    mut recovered: mpsc::Receiver<RecoveredBatch>,
    read_timeout: Duration,
    signal: StopSignal,
) {
    // ---
    while signal.is_running() {
        tokio::select! {
            biased;
            _ = signal.stopped() => break,
            Some(batch) = recovered.recv() => pipeline.on_recovered(batch),
            res = tokio::time::timeout(read_timeout, socket.recv()) => match res {
                Err(_) => pipeline.on_idle(),
                Ok(Ok(data)) => pipeline.on_datagram(data),
                Ok(Err(e)) => warn!("Stream receive failed: {:#}", e),
            },
        }
    }

    // Dropping the socket on return leaves the group
    pipeline.stop();
    debug!("Receive loop exiting");
}

/// Everything the receive loop does with one input, without the socket.
struct ReceivePipeline {
    // ---
    machine: ReceiverMachine,
    ctx: ReceiveContext,
    recovery: RecoveryHandle,
    stats: ReceiverStats,
}

impl ReceivePipeline {
    // ---
    fn new(machine: ReceiverMachine, ctx: ReceiveContext, recovery: RecoveryHandle) -> Self {
        // ---
        Self {
            machine,
            ctx,
            recovery,
            stats: ReceiverStats::default(),
        }
    }

    fn on_datagram(&mut self, data: &[u8]) {
        // ---
        let outcome = self.machine.on_datagram(data);
        self.stats.record(&outcome);

        match outcome {
            Outcome::Started { expected_count, .. } => {
                self.begin_song(expected_count);
                self.ctx
                    .events
                    .publish(&ReceiverEvent::StreamStarted { expected_count });
            }
            Outcome::Restarted { expected_count, .. } => {
                self.begin_song(expected_count);
                self.ctx
                    .events
                    .publish(&ReceiverEvent::StreamRestarted { expected_count });
            }
            Outcome::Stored { fresh: true, .. } => {
                if let Some(m) = &self.ctx.metrics {
                    m.datagrams_received_total.inc();
                }
                self.persist();
                self.try_complete();
            }
            Outcome::Stored { fresh: false, .. } => {}
            Outcome::Dropped(_) | Outcome::OutOfRange { .. } => {
                if let Some(m) = &self.ctx.metrics {
                    m.datagrams_dropped_total.inc();
                }
            }
            Outcome::Finalized => {
                debug!("Sender finalized the stream");
                self.gap_check();
            }
            Outcome::Rejected { .. } | Outcome::Ignored => {}
        }
    }

    fn on_recovered(&mut self, batch: RecoveredBatch) {
        // ---
        let inserted = self.machine.on_recovered(batch.transfer, batch.datagrams);
        if inserted == 0 {
            return;
        }

        self.stats.record_recovered(inserted);
        if let Some(m) = &self.ctx.metrics {
            m.datagrams_recovered_total.inc_by(inserted as u64);
        }

        self.persist();
        self.try_complete();
    }

    /// A receive timeout: an idle stream means datagrams were lost.
    fn on_idle(&mut self) {
        // ---
        if self.machine.state() == ReceiverState::Receiving {
            self.gap_check();
        }
    }

    fn stop(&mut self) {
        // ---
        self.machine.stop();
        self.stats.log();
    }

    fn begin_song(&mut self, expected_count: u32) {
        // ---
        if let Err(e) = self.ctx.sink.reset() {
            warn!("Sink reset failed: {}", e);
        }

        if let Some(m) = &self.ctx.metrics {
            m.reassembly_missing.set(i64::from(expected_count));
        }

        self.recovery
            .request(RecoveryRequest::InitAck { expected_count });
    }

    /// Requests whatever is still missing, unless the song is done.
    fn gap_check(&mut self) {
        // ---
        if self.try_complete() {
            return;
        }

        let Some(transfer) = self.machine.transfer_id() else {
            return;
        };

        match self.machine.missing() {
            Ok(missing) if missing.is_empty() => {}
            Ok(missing) => {
                debug!("Transfer {} missing {} datagrams", transfer, missing.len());
                if let Some(m) = &self.ctx.metrics {
                    m.reassembly_missing.set(missing.len() as i64);
                }
                self.recovery.request(RecoveryRequest::Missing {
                    transfer,
                    sequences: missing,
                });
            }
            Err(e) => warn!("Gap check on transfer {} failed: {}", transfer, e),
        }
    }

    /// Forwards newly contiguous payload to an incremental sink.
    fn persist(&mut self) {
        // ---
        if !self.ctx.sink.persists_incrementally() {
            return;
        }

        let bytes = self.machine.take_contiguous();
        if bytes.is_empty() {
            return;
        }

        if let Err(e) = self.ctx.sink.write_data(&bytes) {
            self.write_dropped(&e);
        }
    }

    fn try_complete(&mut self) -> bool {
        // ---
        let Some(song) = self.machine.finish_if_complete() else {
            return false;
        };

        self.stats.record_completed();
        if let Some(m) = &self.ctx.metrics {
            m.songs_completed_total.inc();
            m.reassembly_missing.set(0);
        }

        if !self.ctx.sink.persists_incrementally() {
            if let Err(e) = self.ctx.sink.write_data(&song.bytes) {
                self.write_dropped(&e);
            }
        }

        let unknown = TrackMetadata::unknown();
        match self.ctx.cache.store(&song.bytes, &unknown.title, &unknown.artist) {
            Ok(handle) => {
                let handle = self.tag(handle);
                info!(
                    "Song complete: {} - {} ({})",
                    handle.artist,
                    handle.title,
                    handle.path.display()
                );
                self.ctx.events.publish(&ReceiverEvent::SongCompleted(handle));
            }
            Err(e) => warn!("Failed to cache completed song: {}", e),
        }

        self.stats.log();
        true
    }

    /// Reads tags from the cached file; on failure the handle stays as is.
    fn tag(&self, handle: CacheHandle) -> CacheHandle {
        // ---
        match self.ctx.metadata.read(&handle.path) {
            Ok(meta) => self
                .ctx
                .cache
                .retag(&handle.hash, &meta.title, &meta.artist)
                .unwrap_or(handle),
            Err(e) => {
                warn!("Cannot read tags of {}: {:#}", handle.path.display(), e);
                handle
            }
        }
    }

    fn write_dropped(&self, e: &CacheError) {
        // ---
        warn!("Dropping sink write: {}", e);
        if let Some(m) = &self.ctx.metrics {
            m.sink_writes_dropped_total.inc();
        }
    }
}
