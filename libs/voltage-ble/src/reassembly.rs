//! Incremental reassembly of fragmented messages
//!
//! One buffer is open at a time. A buffer is emitted once it holds `total`
//! distinct indices; a buffer older than `max_age` is evicted when the next
//! packet arrives.
//!
//! Frames carry no message id, so a straggler from the message just
//! delivered looks like the start of a new one. Until another buffer opens,
//! packets identical to the last completed message are held back. When a
//! full identical copy has been held it is delivered as a repeat. When a
//! different packet opens the next buffer, only held packets with a lower
//! index are kept, since senders emit packets in index order.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{BleError, Result};
use crate::packet::Packet;

/// Default lifetime of an incomplete buffer
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ReassemblyBuffer {
    expected_total: u16,
    received: BTreeMap<u16, Bytes>,
    started_at: Instant,
}

/// The message delivered last, kept to recognise late duplicates
#[derive(Debug)]
struct CompletedMessage {
    total: u16,
    payloads: BTreeMap<u16, Bytes>,
    completed_at: Instant,
    held: BTreeMap<u16, Bytes>,
}

impl CompletedMessage {
    fn matches(&self, packet: &Packet) -> bool {
        self.total == packet.total
            && self
                .payloads
                .get(&packet.index)
                .is_some_and(|payload| *payload == packet.payload)
    }
}

impl ReassemblyBuffer {
    fn new(expected_total: u16, now: Instant) -> Self {
        Self {
            expected_total,
            received: BTreeMap::new(),
            started_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.expected_total as usize
    }

    fn assemble(self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for index in 0..self.expected_total {
            match self.received.get(&index) {
                Some(payload) => data.extend_from_slice(payload),
                None => {
                    return Err(BleError::MissingPacket {
                        index,
                        total: self.expected_total,
                    })
                },
            }
        }
        Ok(data)
    }
}

/// Stateful single-buffer reassembler
#[derive(Debug)]
pub struct Reassembler {
    buffer: Option<ReassemblyBuffer>,
    completed: Option<CompletedMessage>,
    max_age: Option<Duration>,
    evicted: u64,
    discarded: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_AGE))
    }
}

impl Reassembler {
    /// `max_age = None` keeps incomplete buffers forever
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            buffer: None,
            completed: None,
            max_age,
            evicted: 0,
            discarded: 0,
        }
    }

    /// Feed one packet; returns the message once complete
    pub fn push(&mut self, packet: Packet) -> Result<Option<Vec<u8>>> {
        self.push_at(packet, Instant::now())
    }

    /// `push` with an explicit clock reading
    pub fn push_at(&mut self, packet: Packet, now: Instant) -> Result<Option<Vec<u8>>> {
        self.evict_stale(now);

        if packet.total == 0 {
            self.discarded += 1;
            if self.buffer.take().is_some() {
                self.evicted += 1;
            }
            return Err(BleError::invalid_frame(format!(
                "packet {} declares zero total packets",
                packet.index
            )));
        }

        let mut buffer = match self.buffer.take() {
            Some(buffer) if buffer.expected_total == packet.total => buffer,
            Some(buffer) => {
                warn!(
                    "[Reassembly] total changed from {} to {}, dropping {} buffered packets",
                    buffer.expected_total,
                    packet.total,
                    buffer.received.len()
                );
                self.evicted += 1;
                ReassemblyBuffer::new(packet.total, now)
            },
            None => {
                if let Some(repeat) = self.hold_duplicate(&packet, now) {
                    return repeat;
                }
                self.open_buffer(&packet, now)
            },
        };

        if packet.index >= buffer.expected_total {
            warn!(
                "[Reassembly] discarding packet index {} outside 0..{}",
                packet.index, buffer.expected_total
            );
            self.discarded += 1;
            self.buffer = Some(buffer);
            return Ok(None);
        }

        if buffer.received.contains_key(&packet.index) {
            debug!("[Reassembly] duplicate packet {} ignored", packet.index);
        } else {
            buffer.received.insert(packet.index, packet.payload);
        }

        debug!(
            "[Reassembly] {}/{} packets buffered",
            buffer.received.len(),
            buffer.expected_total
        );

        if buffer.is_complete() {
            self.completed = Some(CompletedMessage {
                total: buffer.expected_total,
                payloads: buffer.received.clone(),
                completed_at: now,
                held: BTreeMap::new(),
            });
            return buffer.assemble().map(Some);
        }
        self.buffer = Some(buffer);
        Ok(None)
    }

    /// Hold `packet` if it repeats the last completed message. Returns the
    /// repeated message once every index has been held again.
    fn hold_duplicate(
        &mut self,
        packet: &Packet,
        now: Instant,
    ) -> Option<Result<Option<Vec<u8>>>> {
        let completed = self.completed.as_mut()?;
        if !completed.matches(packet) {
            return None;
        }
        completed.held.insert(packet.index, packet.payload.clone());
        if completed.held.len() < completed.total as usize {
            debug!(
                "[Reassembly] packet {}/{} repeats the last message, held",
                packet.index, packet.total
            );
            return Some(Ok(None));
        }

        debug!("[Reassembly] last message received again in full");
        let repeat = ReassemblyBuffer {
            expected_total: completed.total,
            received: std::mem::take(&mut completed.held),
            started_at: now,
        };
        completed.completed_at = now;
        Some(repeat.assemble().map(Some))
    }

    /// Start a buffer for `packet`, keeping held packets that precede it
    fn open_buffer(&mut self, packet: &Packet, now: Instant) -> ReassemblyBuffer {
        let mut buffer = ReassemblyBuffer::new(packet.total, now);
        if let Some(completed) = self.completed.take() {
            for (index, payload) in completed.held {
                if completed.total == packet.total && index < packet.index {
                    buffer.received.insert(index, payload);
                } else {
                    debug!("[Reassembly] late duplicate packet {} discarded", index);
                    self.discarded += 1;
                }
            }
        }
        buffer
    }

    fn evict_stale(&mut self, now: Instant) {
        if let (Some(max_age), Some(completed)) = (self.max_age, self.completed.as_ref()) {
            if now.saturating_duration_since(completed.completed_at) > max_age {
                self.discarded += completed.held.len() as u64;
                self.completed = None;
            }
        }

        let (Some(max_age), Some(buffer)) = (self.max_age, self.buffer.as_ref()) else {
            return;
        };
        if now.saturating_duration_since(buffer.started_at) > max_age {
            warn!(
                "[Reassembly] evicting stale buffer ({}/{} packets)",
                buffer.received.len(),
                buffer.expected_total
            );
            self.buffer = None;
            self.evicted += 1;
        }
    }

    /// `(received, expected)` of the open buffer
    pub fn pending(&self) -> Option<(usize, u16)> {
        self.buffer
            .as_ref()
            .map(|b| (b.received.len(), b.expected_total))
    }

    /// Buffers dropped by eviction or a total mismatch
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Packets rejected on arrival
    pub fn discarded_count(&self) -> u64 {
        self.discarded
    }

    /// Drop the open buffer and forget the last completed message
    pub fn reset(&mut self) {
        self.buffer = None;
        self.completed = None;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::packet::{FrameFormat, DEFAULT_MTU};

    fn packets_for(data: &[u8]) -> Vec<Packet> {
        FrameFormat::new(DEFAULT_MTU, "P".repeat(25))
            .unwrap()
            .split(data)
            .unwrap()
    }

    #[test]
    fn test_incremental_completion() {
        let data = vec![b'x'; 500];
        let packets = packets_for(&data);
        let mut reassembler = Reassembler::default();

        assert_eq!(reassembler.push(packets[2].clone()).unwrap(), None);
        assert_eq!(reassembler.pending(), Some((1, 3)));
        assert_eq!(reassembler.push(packets[0].clone()).unwrap(), None);
        let out = reassembler.push(packets[1].clone()).unwrap();
        assert_eq!(out, Some(data));
        assert_eq!(reassembler.pending(), None);
    }

    #[test]
    fn test_duplicates_and_out_of_range_are_ignored() {
        let mut reassembler = Reassembler::new(None);
        let first = Packet::new(0, 2, &b"ab"[..]);

        assert_eq!(reassembler.push(first).unwrap(), None);
        assert_eq!(
            reassembler.push(Packet::new(0, 2, &b"zz"[..])).unwrap(),
            None
        );
        assert_eq!(
            reassembler.push(Packet::new(9, 2, &b"??"[..])).unwrap(),
            None
        );
        assert_eq!(reassembler.discarded_count(), 1);

        let out = reassembler.push(Packet::new(1, 2, &b"cd"[..])).unwrap();
        assert_eq!(out.as_deref(), Some(&b"abcd"[..]));
    }

    #[test]
    fn test_stale_buffer_is_evicted() {
        let start = Instant::now();
        let mut reassembler = Reassembler::new(Some(Duration::from_millis(100)));

        reassembler
            .push_at(Packet::new(0, 2, &b"old"[..]), start)
            .unwrap();
        let later = start + Duration::from_millis(500);
        assert_eq!(
            reassembler
                .push_at(Packet::new(1, 2, &b"new"[..]), later)
                .unwrap(),
            None
        );
        assert_eq!(reassembler.evicted_count(), 1);
        assert_eq!(reassembler.pending(), Some((1, 2)));
    }

    #[test]
    fn test_total_mismatch_starts_fresh_buffer() {
        let mut reassembler = Reassembler::new(None);
        reassembler.push(Packet::new(0, 3, &b"a"[..])).unwrap();
        let out = reassembler.push(Packet::new(0, 1, &b"solo"[..])).unwrap();
        assert_eq!(out.as_deref(), Some(&b"solo"[..]));
        assert_eq!(reassembler.evicted_count(), 1);
    }

    #[test]
    fn test_zero_total_rejected_and_aborts_buffer() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(Packet::new(0, 0, &b""[..])).is_err());

        reassembler.push(Packet::new(0, 2, &b"ab"[..])).unwrap();
        assert!(reassembler.push(Packet::new(1, 0, &b""[..])).is_err());
        assert_eq!(reassembler.pending(), None);
        assert_eq!(reassembler.evicted_count(), 1);
    }

    fn push_all(reassembler: &mut Reassembler, payload: &'static [u8]) -> Option<Vec<u8>> {
        let mut out = None;
        for index in 0..3 {
            out = reassembler.push(Packet::new(index, 3, payload)).unwrap();
        }
        out
    }

    #[test]
    fn test_late_packet_is_not_mixed_into_next_message() {
        let mut reassembler = Reassembler::new(None);
        assert_eq!(push_all(&mut reassembler, b"AA").as_deref(), Some(&b"AAAAAA"[..]));

        // straggler from the delivered message
        assert_eq!(reassembler.push(Packet::new(2, 3, &b"AA"[..])).unwrap(), None);
        assert_eq!(reassembler.pending(), None);

        assert_eq!(push_all(&mut reassembler, b"BB").as_deref(), Some(&b"BBBBBB"[..]));
        assert_eq!(reassembler.discarded_count(), 1);
    }

    #[test]
    fn test_identical_message_is_delivered_again() {
        let mut reassembler = Reassembler::new(None);
        assert_eq!(push_all(&mut reassembler, b"AA").as_deref(), Some(&b"AAAAAA"[..]));
        assert_eq!(push_all(&mut reassembler, b"AA").as_deref(), Some(&b"AAAAAA"[..]));
    }

    #[test]
    fn test_next_message_sharing_first_packet() {
        let mut reassembler = Reassembler::new(None);
        push_all(&mut reassembler, b"AA").unwrap();

        assert_eq!(reassembler.push(Packet::new(0, 3, &b"AA"[..])).unwrap(), None);
        assert_eq!(reassembler.push(Packet::new(1, 3, &b"BB"[..])).unwrap(), None);
        let out = reassembler.push(Packet::new(2, 3, &b"BB"[..])).unwrap();
        assert_eq!(out.as_deref(), Some(&b"AABBBB"[..]));
    }

    #[test]
    fn test_held_duplicates_expire() {
        let start = Instant::now();
        let mut reassembler = Reassembler::new(Some(Duration::from_millis(100)));
        for index in 0..2 {
            reassembler
                .push_at(Packet::new(index, 2, &b"AA"[..]), start)
                .unwrap();
        }

        let later = start + Duration::from_millis(500);
        reassembler
            .push_at(Packet::new(0, 2, &b"AA"[..]), later)
            .unwrap();
        // past max_age the same payload starts a fresh message
        assert_eq!(reassembler.pending(), Some((1, 2)));
    }
}
