//! Statistics tracking for the stream receiver.
//!
//! Counts what happened to every datagram and song so the receive loop can
//! log a periodic summary.

use std::time::{Duration, Instant};
use tracing::info;

use crate::machine::Outcome;

/// Reception statistics.
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    // ---
    /// Datagrams inserted into a reassembly buffer for the first time
    pub datagrams_received: u64,

    /// Datagrams whose sequence number was already held
    pub datagrams_duplicate: u64,

    /// Datagrams dropped as corrupt or outside the current song
    pub datagrams_dropped: u64,

    /// Datagrams filled in over the recovery channel
    pub datagrams_recovered: u64,

    /// Streams accepted (including restarts)
    pub streams_started: u64,

    /// Streams rejected for an out-of-range datagram count
    pub streams_rejected: u64,

    pub songs_completed: u64,

    start_time: Instant,
    last_log_time: Instant,
    log_interval: Duration,
}

impl ReceiverStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `log_interval` - How often to automatically log stats
    pub fn new(log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            datagrams_received: 0,
            datagrams_duplicate: 0,
            datagrams_dropped: 0,
            datagrams_recovered: 0,
            streams_started: 0,
            streams_rejected: 0,
            songs_completed: 0,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    /// Records the outcome of one multicast datagram.
    pub fn record(&mut self, outcome: &Outcome) {
        // ---
        match outcome {
            Outcome::Stored { fresh: true, .. } => self.datagrams_received += 1,
            Outcome::Stored { fresh: false, .. } => self.datagrams_duplicate += 1,
            Outcome::Dropped(_) | Outcome::OutOfRange { .. } => self.datagrams_dropped += 1,
            Outcome::Started { .. } | Outcome::Restarted { .. } => self.streams_started += 1,
            Outcome::Rejected { .. } => self.streams_rejected += 1,
            Outcome::Ignored | Outcome::Finalized => {}
        }

        self.maybe_log();
    }

    pub fn record_recovered(&mut self, count: usize) {
        self.datagrams_recovered += count as u64;
    }

    pub fn record_completed(&mut self) {
        self.songs_completed += 1;
    }

    /// Share of stored datagrams that had to be recovered.
    pub fn recovery_percentage(&self) -> f64 {
        // ---
        let total = self.datagrams_received + self.datagrams_recovered;
        if total == 0 {
            0.0
        } else {
            (self.datagrams_recovered as f64 / total as f64) * 100.0
        }
    }

    /// Calculates datagrams per second reception rate.
    pub fn datagrams_per_second(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.datagrams_received as f64 / elapsed
        }
    }

    /// Logs statistics if interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "RX Stats: {} datagrams ({:.2}/s), {} dup, {} dropped, {:.2}% recovered, {} songs",
            self.datagrams_received,
            self.datagrams_per_second(),
            self.datagrams_duplicate,
            self.datagrams_dropped,
            self.recovery_percentage(),
            self.songs_completed
        );
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        // ---
        Self::new(Duration::from_secs(5))
    }
}
