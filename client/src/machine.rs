//! Receiver state machine.
//!
//! ```text
//!            init (valid count)
//!  WAITING ─────────────────────▶ RECEIVING ──┐ datagram / init (restart)
//!     ▲                               │  ▲    │
//!     └──────── song complete ────────┘  └────┘
//!
//!  any state ── stop ──▶ STOPPED
//! ```
//!
//! The machine owns the reassembly buffer of the song in flight and is
//! driven by one task, so the buffer has a single writer. Datagrams
//! recovered over TCP are fed back through [`ReceiverMachine::on_recovered`].

use tracing::{debug, info, warn};
use wss_common::{
    datagram, ControlMessage, Datagram, ReassemblyBuffer, ReassemblyError, WireError,
    CONTROL_FRAME_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Waiting,
    Receiving,
    Stopped,
}

/// What happened to one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do (wrong state, unrelated control token).
    Ignored,

    /// A new song started from `WAITING`.
    Started { transfer: u64, expected_count: u32 },

    /// A new song replaced the one in flight.
    Restarted { transfer: u64, expected_count: u32 },

    /// An init carried an out-of-range datagram count.
    Rejected { expected_count: u32 },

    /// A datagram was inserted. `fresh` is false for duplicates.
    Stored { sequence: u32, fresh: bool },

    /// A datagram failed to decode and was dropped.
    Dropped(WireError),

    /// A datagram carried a sequence number outside the current song.
    OutOfRange { sequence: u32 },

    /// The sender finished transmitting the current song.
    Finalized,
}

/// A song that finished reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSong {
    pub transfer: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Transfer {
    id: u64,
    buffer: ReassemblyBuffer,
    /// Highest sequence whose payload (and all before it) was handed out
    persisted_through: u32,
}

/// State machine for the client side of a stream.
#[derive(Debug)]
pub struct ReceiverMachine {
    // ---
    state: ReceiverState,
    transfer: Option<Transfer>,
    max_expected_count: u32,
    next_transfer: u64,
}

impl ReceiverMachine {
    // ---
    /// Creates a machine in `WAITING` that accepts songs of at most
    /// `max_expected_count` datagrams.
    pub fn new(max_expected_count: u32) -> Self {
        // ---
        Self {
            state: ReceiverState::Waiting,
            transfer: None,
            max_expected_count,
            next_transfer: 1,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Identifier of the song in flight.
    pub fn transfer_id(&self) -> Option<u64> {
        self.transfer.as_ref().map(|t| t.id)
    }

    pub fn expected_count(&self) -> Option<u32> {
        self.transfer.as_ref().map(|t| t.buffer.expected_count())
    }

    /// Handles one raw datagram from the multicast socket.
    pub fn on_datagram(&mut self, data: &[u8]) -> Outcome {
        // ---
        match self.state {
            ReceiverState::Stopped => Outcome::Ignored,
            ReceiverState::Waiting => match parse_control(data) {
                Some(ControlMessage::StreamInit { expected_count }) => self.begin(expected_count),
                _ => Outcome::Ignored,
            },
            ReceiverState::Receiving => match parse_control(data) {
                Some(ControlMessage::StreamInit { expected_count }) => self.begin(expected_count),
                Some(ControlMessage::Finalize) => Outcome::Finalized,
                Some(other) => {
                    debug!("Ignoring control {} on stream path", other);
                    Outcome::Ignored
                }
                None => self.on_payload(data),
            },
        }
    }

    /// Inserts datagrams recovered for `transfer`.
    ///
    /// Datagrams for a song that is no longer in flight are discarded.
    /// Returns the number of newly received sequence numbers.
    pub fn on_recovered(&mut self, transfer: u64, datagrams: Vec<Datagram>) -> usize {
        // ---
        let Some(current) = self.transfer.as_mut().filter(|t| t.id == transfer) else {
            debug!("Discarding {} recovered datagrams for stale transfer {}", datagrams.len(), transfer);
            return 0;
        };

        let expected = current.buffer.expected_count();
        datagrams
            .into_iter()
            .filter(|d| (1..=expected).contains(&d.sequence))
            .filter(|d| current.buffer.add(d.clone()))
            .count()
    }

    /// Sequence numbers still missing from the song in flight.
    ///
    /// Returns `Ok(vec![])` when no song is in flight.
    pub fn missing(&self) -> Result<Vec<u32>, ReassemblyError> {
        // ---
        match &self.transfer {
            Some(t) => t.buffer.missing_sequence_numbers(),
            None => Ok(Vec::new()),
        }
    }

    /// Payload bytes that extend the contiguous received prefix since the
    /// last call. Empty when nothing new is contiguous.
    pub fn take_contiguous(&mut self) -> Vec<u8> {
        // ---
        let Some(t) = self.transfer.as_mut() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        while let Some(d) = t.buffer.get(t.persisted_through + 1) {
            out.extend_from_slice(&d.payload);
            t.persisted_through += 1;
        }
        out
    }

    /// If the song in flight is complete, assembles it and returns to
    /// `WAITING`.
    pub fn finish_if_complete(&mut self) -> Option<CompletedSong> {
        // ---
        let bytes = self.transfer.as_ref()?.buffer.assemble()?;
        let transfer = self.transfer.take()?;

        info!(
            "Transfer {} complete: {} datagrams, {} bytes",
            transfer.id,
            transfer.buffer.expected_count(),
            bytes.len()
        );

        self.state = ReceiverState::Waiting;
        Some(CompletedSong {
            transfer: transfer.id,
            bytes,
        })
    }

    /// Terminal transition; the in-flight song is discarded.
    pub fn stop(&mut self) {
        // ---
        self.transfer = None;
        self.state = ReceiverState::Stopped;
    }

    fn begin(&mut self, expected_count: u32) -> Outcome {
        // ---
        if expected_count == 0 || expected_count > self.max_expected_count {
            warn!(
                "Rejecting stream of {} datagrams (max {})",
                expected_count, self.max_expected_count
            );
            return Outcome::Rejected { expected_count };
        }

        let id = self.next_transfer;
        self.next_transfer += 1;

        let restarted = self.transfer.is_some();
        self.transfer = Some(Transfer {
            id,
            buffer: ReassemblyBuffer::new(expected_count),
            persisted_through: 0,
        });
        self.state = ReceiverState::Receiving;

        if restarted {
            info!("Stream restarted: transfer {} expects {} datagrams", id, expected_count);
            Outcome::Restarted {
                transfer: id,
                expected_count,
            }
        } else {
            info!("Stream started: transfer {} expects {} datagrams", id, expected_count);
            Outcome::Started {
                transfer: id,
                expected_count,
            }
        }
    }

    fn on_payload(&mut self, data: &[u8]) -> Outcome {
        // ---
        let Some(t) = self.transfer.as_mut() else {
            return Outcome::Ignored;
        };

        let (sequence, payload) = match datagram::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Dropping datagram: {}", e);
                return Outcome::Dropped(e);
            }
        };

        if !(1..=t.buffer.expected_count()).contains(&sequence) {
            debug!("Dropping datagram {} outside transfer {}", sequence, t.id);
            return Outcome::OutOfRange { sequence };
        }

        let fresh = t.buffer.add(Datagram::new(sequence, payload.to_vec()));
        Outcome::Stored { sequence, fresh }
    }
}

/// A datagram is control only if it has the control frame size and parses.
fn parse_control(data: &[u8]) -> Option<ControlMessage> {
    // ---
    if data.len() != CONTROL_FRAME_SIZE {
        return None;
    }
    ControlMessage::parse(data).ok()
}
