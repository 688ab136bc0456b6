//! Reassembly buffer for one song transfer.
//!
//! Collects datagrams keyed by sequence number and reports completeness and
//! gaps. The sender keeps one as its authoritative copy of the song being
//! streamed; receivers fill one per in-flight song.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::datagram::Datagram;

/// Protocol violations detected while inspecting a buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("invalid expected datagram count: {0}")]
    InvalidExpectedCount(u32),

    #[error("buffer overflow: {received} datagrams received, {expected} expected")]
    Overflow { received: usize, expected: u32 },
}

/// Datagrams of one transfer, keyed by sequence number.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    // ---
    expected_count: u32,
    received: BTreeMap<u32, Datagram>,
}

impl ReassemblyBuffer {
    // ---
    /// Creates an empty buffer expecting `expected_count` datagrams.
    pub fn new(expected_count: u32) -> Self {
        // ---
        Self {
            expected_count,
            received: BTreeMap::new(),
        }
    }

    /// Builds a complete buffer from already-split datagrams.
    pub fn from_datagrams(datagrams: Vec<Datagram>) -> Self {
        // ---
        let mut buffer = Self::new(datagrams.len() as u32);
        for datagram in datagrams {
            buffer.add(datagram);
        }
        buffer
    }

    /// Inserts a datagram, overwriting any previous one with the same
    /// sequence number.
    ///
    /// Returns `true` if the sequence number was not present before.
    pub fn add(&mut self, datagram: Datagram) -> bool {
        // ---
        self.received.insert(datagram.sequence, datagram).is_none()
    }

    /// Returns `true` once every sequence number in `1..=expected_count`
    /// has been received and nothing else has.
    pub fn is_complete(&self) -> bool {
        // ---
        if self.expected_count == 0 || self.received.len() != self.expected_count as usize {
            return false;
        }

        let first = self.received.keys().next().copied();
        let last = self.received.keys().next_back().copied();
        first == Some(1) && last == Some(self.expected_count)
    }

    /// Computes `{1..=expected_count} - received`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns [`ReassemblyError::InvalidExpectedCount`] for an empty
    /// transfer and [`ReassemblyError::Overflow`] when more datagrams than
    /// expected have been inserted. Both mean the remote side broke the
    /// protocol.
    pub fn missing_sequence_numbers(&self) -> Result<Vec<u32>, ReassemblyError> {
        // ---
        if self.expected_count == 0 {
            return Err(ReassemblyError::InvalidExpectedCount(self.expected_count));
        }

        if self.received.len() > self.expected_count as usize {
            return Err(ReassemblyError::Overflow {
                received: self.received.len(),
                expected: self.expected_count,
            });
        }

        Ok((1..=self.expected_count)
            .filter(|seq| !self.received.contains_key(seq))
            .collect())
    }

    /// Looks up a datagram by sequence number.
    pub fn get(&self, sequence: u32) -> Option<&Datagram> {
        self.received.get(&sequence)
    }

    pub fn expected_count(&self) -> u32 {
        self.expected_count
    }

    /// Number of distinct sequence numbers received.
    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// Concatenates payloads in sequence order.
    ///
    /// Returns `None` until the buffer is complete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        // ---
        if !self.is_complete() {
            return None;
        }

        let total: usize = self.received.values().map(|d| d.payload.len()).sum();
        let mut song = Vec::with_capacity(total);
        for datagram in self.received.values() {
            song.extend_from_slice(&datagram.payload);
        }
        Some(song)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn datagram(seq: u32) -> Datagram {
        Datagram::new(seq, vec![seq as u8; 4])
    }

    #[test]
    fn test_gap_then_complete() {
        // ---
        let mut buffer = ReassemblyBuffer::new(3);
        buffer.add(datagram(1));
        buffer.add(datagram(3));

        assert_eq!(buffer.missing_sequence_numbers(), Ok(vec![2]));
        assert!(!buffer.is_complete());

        buffer.add(datagram(2));
        assert!(buffer.is_complete());
        assert_eq!(buffer.missing_sequence_numbers(), Ok(vec![]));
    }

    #[test]
    fn test_duplicate_overwrites() {
        // ---
        let mut buffer = ReassemblyBuffer::new(2);

        assert!(buffer.add(datagram(1)));
        assert!(!buffer.add(Datagram::new(1, vec![0xAA])));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(1).map(|d| d.payload.clone()), Some(vec![0xAA]));
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        // ---
        let mut buffer = ReassemblyBuffer::new(5);
        for seq in [5, 2, 4, 1, 3] {
            buffer.add(datagram(seq));
        }

        assert!(buffer.is_complete());
        let song = buffer.assemble().expect("complete");
        assert_eq!(&song[..4], &[1, 1, 1, 1]);
        assert_eq!(&song[16..], &[5, 5, 5, 5]);
    }

    #[test]
    fn test_invalid_expected_count() {
        // ---
        let buffer = ReassemblyBuffer::new(0);

        assert_eq!(
            buffer.missing_sequence_numbers(),
            Err(ReassemblyError::InvalidExpectedCount(0))
        );
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_overflow_reported() {
        // ---
        let mut buffer = ReassemblyBuffer::new(2);
        buffer.add(datagram(1));
        buffer.add(datagram(2));
        buffer.add(datagram(9)); // stray sequence from a misbehaving sender

        assert!(!buffer.is_complete());
        assert!(matches!(
            buffer.missing_sequence_numbers(),
            Err(ReassemblyError::Overflow { received: 3, expected: 2 })
        ));
    }

    #[test]
    fn test_out_of_range_key_blocks_completion() {
        // ---
        let mut buffer = ReassemblyBuffer::new(2);
        buffer.add(datagram(1));
        buffer.add(datagram(3));

        assert!(!buffer.is_complete());
        assert_eq!(buffer.missing_sequence_numbers(), Ok(vec![2]));
        assert!(buffer.assemble().is_none());
    }

    #[test]
    fn test_missing_matches_complement() {
        // ---
        let expected = 40u32;
        let mut buffer = ReassemblyBuffer::new(expected);
        let received: Vec<u32> = (1..=expected).filter(|s| s % 3 != 0).collect();
        for &seq in &received {
            buffer.add(datagram(seq));
        }

        let missing = buffer.missing_sequence_numbers().expect("valid");
        let complement: Vec<u32> = (1..=expected).filter(|s| s % 3 == 0).collect();
        assert_eq!(missing, complement);
        assert_eq!(missing.is_empty(), buffer.is_complete());
    }

    #[test]
    fn test_from_datagrams() {
        // ---
        let buffer =
            ReassemblyBuffer::from_datagrams(vec![datagram(1), datagram(2), datagram(3)]);

        assert_eq!(buffer.expected_count(), 3);
        assert!(buffer.is_complete());
    }
}
