//! Discovery wire tokens shared by the server and client roles.

/// Presence beacon broadcast by the server.
pub const SERVER_BEACON: &[u8] = b"WSSServer";

/// Acknowledgement unicast by a client back to the server.
pub const CLIENT_ACK: &[u8] = b"WSSClient";

/// A recognised discovery payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryToken {
    ServerBeacon,
    ClientAck,
}

impl DiscoveryToken {
    // ---
    /// Classifies a received payload. Surrounding whitespace and NUL padding
    /// are tolerated; anything else yields `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        // ---
        let trimmed = trim(data);
        if trimmed == SERVER_BEACON {
            Some(DiscoveryToken::ServerBeacon)
        } else if trimmed == CLIENT_ACK {
            Some(DiscoveryToken::ClientAck)
        } else {
            None
        }
    }
}

fn trim(data: &[u8]) -> &[u8] {
    // ---
    let is_pad = |b: &u8| *b == 0 || b.is_ascii_whitespace();
    let start = data.iter().position(|b| !is_pad(b)).unwrap_or(data.len());
    let end = data.iter().rposition(|b| !is_pad(b)).map_or(start, |i| i + 1);
    &data[start..end]
}
