//! Registry of clients discovered through acknowledgements.
//!
//! Mutated by the acknowledgement loop and the expiry sweep; read by any
//! consumer through [`PeerRegistry::snapshot`]. All access goes through one
//! mutex.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// One discovered client. Identity is the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    // ---
    pub address: IpAddr,
    pub display_name: String,
    pub last_seen: Instant,
}

/// Result of recording an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Refreshed,
}

/// Peers in first-seen order.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    // ---
    peers: Mutex<Vec<Peer>>,
}

impl PeerRegistry {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a peer for an unseen address, else refreshes `last_seen`.
    ///
    /// New peers are named after their address until renamed.
    pub fn upsert(&self, address: IpAddr, now: Instant) -> Upsert {
        // ---
        let mut peers = self.peers.lock();
        match peers.iter_mut().find(|p| p.address == address) {
            Some(peer) => {
                peer.last_seen = now;
                Upsert::Refreshed
            }
            None => {
                peers.push(Peer {
                    address,
                    display_name: address.to_string(),
                    last_seen: now,
                });
                Upsert::Inserted
            }
        }
    }

    /// Updates the display name of a known peer.
    ///
    /// Returns `false` if the address is not registered.
    pub fn rename(&self, address: IpAddr, display_name: impl Into<String>) -> bool {
        // ---
        let mut peers = self.peers.lock();
        match peers.iter_mut().find(|p| p.address == address) {
            Some(peer) => {
                peer.display_name = display_name.into();
                true
            }
            None => false,
        }
    }

    /// Removes every peer silent for longer than `timeout` as of `now`.
    ///
    /// Returns the removed peers in registry order. A peer is returned by
    /// at most one sweep since it is gone afterwards.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<Peer> {
        // ---
        let mut peers = self.peers.lock();
        let mut expired = Vec::new();

        peers.retain(|peer| {
            let silent = now.saturating_duration_since(peer.last_seen);
            if silent > timeout {
                expired.push(peer.clone());
                false
            } else {
                true
            }
        });

        expired
    }

    pub fn get(&self, address: IpAddr) -> Option<Peer> {
        self.peers.lock().iter().find(|p| p.address == address).cloned()
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.peers.lock().iter().any(|p| p.address == address)
    }

    /// Copy of the current peers, in first-seen order.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
