//! Wire datagram structure and serialization.
//!
//! Every audio datagram carried over the multicast group (and replayed over
//! the recovery channel) uses the same fixed 8-byte header followed by at
//! most [`MAX_PAYLOAD`] bytes of raw song data.

use thiserror::Error;

/// Maximum payload bytes carried by a single datagram.
pub const MAX_PAYLOAD: usize = 700;

/// Fixed header size: sequence number + total length, both big-endian `i32`.
pub const HEADER_SIZE: usize = 8;

/// Largest encoded datagram on the wire.
pub const MAX_DATAGRAM_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

/// Codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),

    #[error("corrupt packet: {0}")]
    CorruptPacket(String),

    #[error("invalid max payload: {0} (must be 1..={MAX_PAYLOAD})")]
    InvalidMaxPayload(usize),
}

/// One sequenced unit of a song transfer.
///
/// Sequence numbers are 1-based and unique within one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    // ---
    /// Position of this datagram within the transfer (1-based)
    pub sequence: u32,

    /// Raw song bytes
    pub payload: Vec<u8>,
}

impl Datagram {
    // ---
    /// Creates a new datagram with the given sequence number and payload.
    pub fn new(sequence: u32, payload: Vec<u8>) -> Self {
        // ---
        Self { sequence, payload }
    }

    /// Serializes the datagram into wire format.
    ///
    /// # Wire Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                        sequence number                        |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                 total length (header + payload)               |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |                     payload (<= 700 bytes)                    |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`WireError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        // ---
        encode(self.sequence, &self.payload)
    }

    /// Deserializes a datagram from wire format.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::CorruptPacket`] if the buffer is shorter than the
    /// header, if the declared total length differs from the buffer size,
    /// or if the implied payload length is out of range.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        // ---
        let (sequence, payload) = decode(data)?;
        Ok(Self::new(sequence, payload.to_vec()))
    }
}

/// Encodes a sequence number and payload into one wire datagram.
///
/// # Errors
///
/// Returns [`WireError::PayloadTooLarge`] if `payload` exceeds [`MAX_PAYLOAD`].
pub fn encode(sequence: u32, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    // ---
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let total = (HEADER_SIZE + payload.len()) as i32;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());

    // Bytes 0-3: sequence number (big-endian)
    buf.extend_from_slice(&(sequence as i32).to_be_bytes());

    // Bytes 4-7: total length including header (big-endian)
    buf.extend_from_slice(&total.to_be_bytes());

    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decodes one wire datagram, borrowing the payload from `data`.
///
/// # Errors
///
/// Returns [`WireError::CorruptPacket`] on any header inconsistency.
pub fn decode(data: &[u8]) -> Result<(u32, &[u8]), WireError> {
    // ---
    if data.len() < HEADER_SIZE {
        return Err(WireError::CorruptPacket(format!(
            "packet too small: {} bytes",
            data.len()
        )));
    }

    let sequence = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let total = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if total < 0 || total as usize != data.len() {
        return Err(WireError::CorruptPacket(format!(
            "declared length {} does not match actual {}",
            total,
            data.len()
        )));
    }

    let payload_len = total as i64 - HEADER_SIZE as i64;
    if payload_len < 0 || payload_len as usize > MAX_PAYLOAD {
        return Err(WireError::CorruptPacket(format!(
            "payload length {} out of range",
            payload_len
        )));
    }

    Ok((sequence as u32, &data[HEADER_SIZE..]))
}

/// Reads the declared total length from a datagram header.
///
/// Used by stream readers that need to frame back-to-back datagrams.
/// Returns `None` when the declared length is outside the valid range.
pub fn declared_len(header: &[u8; HEADER_SIZE]) -> Option<usize> {
    // ---
    let total = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if total < HEADER_SIZE as i32 || total as usize > MAX_DATAGRAM_SIZE {
        return None;
    }
    Some(total as usize)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_encode_header_layout() {
        // ---
        let encoded = encode(258, &[9, 8, 7]).expect("encode failed");

        assert_eq!(encoded.len(), 11);
        assert_eq!(&encoded[0..4], &[0, 0, 1, 2]);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 11]);
        assert_eq!(&encoded[8..], &[9, 8, 7]);
    }

    #[test]
    fn test_decode_roundtrip() {
        // ---
        let payload: Vec<u8> = (0..MAX_PAYLOAD).map(|i| (i % 251) as u8).collect();
        let encoded = encode(42, &payload).expect("encode failed");
        let (seq, decoded) = decode(&encoded).expect("decode failed");

        assert_eq!(seq, 42);
        assert_eq!(decoded, payload.as_slice());
    }

    #[test]
    fn test_payload_too_large() {
        // ---
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode(1, &payload),
            Err(WireError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        // ---
        let mut encoded = encode(1, &[1, 2, 3, 4]).expect("encode failed");
        encoded.pop(); // truncated in flight

        assert!(matches!(decode(&encoded), Err(WireError::CorruptPacket(_))));
    }

    #[test]
    fn test_too_small_is_corrupt() {
        // ---
        assert!(matches!(decode(&[0, 1, 2]), Err(WireError::CorruptPacket(_))));
    }

    #[test]
    fn test_oversized_declared_payload_is_corrupt() {
        // ---
        let mut data = vec![0u8; HEADER_SIZE + MAX_PAYLOAD + 1];
        data[3] = 1;
        let len = data.len() as i32;
        data[4..8].copy_from_slice(&len.to_be_bytes());

        assert!(matches!(decode(&data), Err(WireError::CorruptPacket(_))));
    }

    #[test]
    fn test_declared_len() {
        // ---
        let encoded = encode(7, &[0u8; 100]).expect("encode failed");
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&encoded[..HEADER_SIZE]);

        assert_eq!(declared_len(&header), Some(108));
    }
}
