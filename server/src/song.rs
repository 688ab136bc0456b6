//! The server's authoritative copies of recently streamed songs.
//!
//! A client may still be recovering song N after the playlist has moved on
//! to song N+1, so the last few songs stay available. Each recovery
//! connection binds to the song its client acknowledged and is served from
//! that song only.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use wss_common::{Datagram, ReassemblyBuffer};

/// Songs kept for recovery, newest included.
pub const SONG_HISTORY: usize = 4;

/// One streamed song and the id it was installed under.
#[derive(Debug)]
pub struct Song {
    // ---
    pub id: u64,
    pub buffer: ReassemblyBuffer,
}

impl Song {
    pub fn expected_count(&self) -> u32 {
        self.buffer.expected_count()
    }

    pub fn get(&self, sequence: u32) -> Option<&Datagram> {
        self.buffer.get(sequence)
    }
}

#[derive(Debug, Default)]
struct History {
    next_id: u64,
    songs: VecDeque<Arc<Song>>,
}

/// Shared handle to the recently streamed songs.
///
/// The streamer installs a new song when it starts one; recovery readers
/// hold an `Arc` to the song they serve, so a later install never disturbs
/// a reply in progress.
#[derive(Clone, Default)]
pub struct CurrentSong {
    // ---
    inner: Arc<RwLock<History>>,
}

impl CurrentSong {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `buffer` as the newest song and returns it.
    ///
    /// The oldest song is dropped once more than [`SONG_HISTORY`] are held.
    pub fn replace(&self, buffer: ReassemblyBuffer) -> Arc<Song> {
        // ---
        let mut history = self.inner.write();
        history.next_id += 1;

        let song = Arc::new(Song {
            id: history.next_id,
            buffer,
        });
        history.songs.push_back(Arc::clone(&song));
        while history.songs.len() > SONG_HISTORY {
            history.songs.pop_front();
        }
        song
    }

    /// The newest song, if any.
    pub fn snapshot(&self) -> Option<Arc<Song>> {
        self.inner.read().songs.back().cloned()
    }

    /// The newest held song of `expected_count` datagrams.
    ///
    /// This is what a client's `<ack>stream</ack>N` refers to: it acks
    /// right after the init, before the server can have moved on to
    /// another song of the same length.
    pub fn newest_with_count(&self, expected_count: u32) -> Option<Arc<Song>> {
        // ---
        self.inner
            .read()
            .songs
            .iter()
            .rev()
            .find(|s| s.expected_count() == expected_count)
            .cloned()
    }
}
