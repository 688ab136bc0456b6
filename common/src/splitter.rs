//! Slices a song buffer into sequenced datagrams.

use crate::datagram::{Datagram, WireError, MAX_PAYLOAD};

/// Splits `buffer` into datagrams of at most `max_payload` bytes.
///
/// Sequence numbers are assigned 1..=N in buffer order, where
/// N = ⌈len / max_payload⌉. The final datagram may be shorter than
/// `max_payload`. An empty buffer yields no datagrams.
///
/// # Errors
///
/// Returns [`WireError::InvalidMaxPayload`] unless `max_payload` is in
/// `1..=MAX_PAYLOAD`; larger chunks could not be encoded.
pub fn split(buffer: &[u8], max_payload: usize) -> Result<Vec<Datagram>, WireError> {
    // ---
    if !(1..=MAX_PAYLOAD).contains(&max_payload) {
        return Err(WireError::InvalidMaxPayload(max_payload));
    }

    Ok(buffer
        .chunks(max_payload)
        .enumerate()
        .map(|(i, payload)| Datagram::new(i as u32 + 1, payload.to_vec()))
        .collect())
}
