//! Streaming server library.
//!
//! Splits songs into datagrams, multicasts them, keeps the current song as
//! the authoritative copy for the recovery channel, and announces itself
//! to clients through discovery.

pub mod discovery;
pub mod network;
pub mod recovery;
pub mod registry;
pub mod song;

pub use discovery::{DiscoveryEvent, DiscoveryServer, DiscoverySettings, PeerTracker};
pub use network::MulticastSender;
pub use recovery::RecoveryServer;
pub use registry::{Peer, PeerRegistry};
pub use song::{CurrentSong, Song, SONG_HISTORY};

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use wss_common::{split, ControlMessage, MetricsContext, ReassemblyBuffer, MAX_PAYLOAD};

/// Streams one song over multicast.
///
/// Splits `song` into datagrams, installs them as the current song for the
/// recovery channel, then sends the init frame, every datagram in order
/// and the finalization frame.
///
/// # Arguments
///
/// * `song` - Raw audio file bytes
/// * `sender` - Multicast sender
/// * `current` - Authoritative song shared with the recovery server
/// * `interval` - Pause between datagrams
/// * `metrics` - Optional metrics context
///
/// # Errors
///
/// Returns error if a datagram or control frame cannot be encoded.
/// Transient send failures are logged and do not abort the stream.
pub async fn stream_song(
    song: &[u8],
    sender: &mut MulticastSender,
    current: &CurrentSong,
    interval: Duration,
    metrics: Option<&MetricsContext>,
) -> Result<usize> {
    // ---
    let datagrams = split(song, MAX_PAYLOAD).context("failed to split song")?;
    if datagrams.is_empty() {
        warn!("Skipping empty song");
        return Ok(0);
    }

    let song_ref = current.replace(ReassemblyBuffer::from_datagrams(datagrams));
    let expected_count = song_ref.expected_count();

    info!(
        "Streaming song {}: {} bytes as {} datagrams to {}",
        song_ref.id,
        song.len(),
        expected_count,
        sender.destination()
    );

    sender
        .send_control(&ControlMessage::StreamInit { expected_count })
        .await
        .context("failed to send stream init")?;
    pace(interval).await;

    for seq in 1..=expected_count {
        let Some(datagram) = song_ref.get(seq) else {
            continue;
        };

        sender
            .send_datagram(datagram)
            .await
            .with_context(|| format!("failed to send datagram {}", seq))?;

        if let Some(m) = metrics {
            m.datagrams_sent_total.inc();
        }

        pace(interval).await;
    }

    sender
        .send_control(&ControlMessage::Finalize)
        .await
        .context("failed to send stream finalization")?;

    info!("Streamed {} datagrams", expected_count);
    Ok(expected_count as usize)
}

async fn pace(interval: Duration) {
    // ---
    if interval.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(interval).await;
    }
}
