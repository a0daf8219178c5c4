//! Fragment group reassembly
//!
//! Collects partial fragment groups keyed by `(sender, group_id)` until all
//! `frag_total` fragments arrived, then emits the reassembled message.
//! Duplicates are idempotent and groups that never complete are evicted
//! after a TTL so loss cannot grow the buffer without bound.

use super::{Frame, TunnelError};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Reassembly buffer for partial fragment groups.
pub struct FragmentBuffer {
    groups: HashMap<(u64, u32), PartialGroup>,
    ttl: Duration,
}

struct PartialGroup {
    total: u16,
    parts: Vec<Option<Bytes>>,
    have: u16,
    first_seen: Instant,
}

impl FragmentBuffer {
    /// `ttl` should be at least three window periods.
    pub fn new(ttl: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            ttl,
        }
    }

    /// Insert one fragment. Returns the reassembled message when the frame
    /// completes its group. Single-fragment groups bypass buffering.
    ///
    /// Each fragment's payload is truncated to its declared `real_len`
    /// before assembly, so padding never reaches the consumer.
    pub fn insert(&mut self, sender: u64, frame: &Frame) -> Result<Option<Bytes>, TunnelError> {
        if frame.frag_total == 1 {
            return Ok(Some(frame.payload.slice(..frame.real_len as usize)));
        }

        let key = (sender, frame.group_id);
        let group = self.groups.entry(key).or_insert_with(|| PartialGroup {
            total: frame.frag_total,
            parts: vec![None; frame.frag_total as usize],
            have: 0,
            first_seen: Instant::now(),
        });

        if group.total != frame.frag_total {
            return Err(TunnelError::Malformed(format!(
                "group {} frag_total changed from {} to {}",
                frame.group_id, group.total, frame.frag_total
            )));
        }

        let slot = &mut group.parts[frame.frag_id as usize];
        if slot.is_some() {
            // Duplicate copy from a redundant path, drop silently
            return Ok(None);
        }
        *slot = Some(frame.payload.slice(..frame.real_len as usize));
        group.have += 1;

        if group.have < group.total {
            return Ok(None);
        }

        let group = self.groups.remove(&key).expect("complete group present");
        let len: usize = group
            .parts
            .iter()
            .map(|p| p.as_ref().map(Bytes::len).unwrap_or(0))
            .sum();
        let mut message = BytesMut::with_capacity(len);
        for part in group.parts {
            message.put_slice(&part.expect("all fragments present"));
        }
        Ok(Some(message.freeze()))
    }

    /// Evict groups older than the TTL. Returns the number evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.groups.len();
        let ttl = self.ttl;
        self.groups
            .retain(|_, group| now.duration_since(group.first_seen) < ttl);
        before - self.groups.len()
    }

    /// Number of incomplete groups currently buffered.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(sender_seq: u32, group_id: u32, frag_id: u16, frag_total: u16, data: &[u8]) -> Frame {
        Frame::data(
            sender_seq,
            group_id,
            frag_id,
            frag_total,
            Bytes::copy_from_slice(data),
            data.len() as u16,
        )
    }

    #[test]
    fn single_fragment_bypasses_buffer() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        let out = buffer.insert(1, &frag(0, 9, 0, 1, b"solo")).unwrap();
        assert_eq!(out.unwrap(), Bytes::from_static(b"solo"));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        assert!(buffer.insert(1, &frag(2, 5, 2, 3, b"c")).unwrap().is_none());
        assert!(buffer.insert(1, &frag(0, 5, 0, 3, b"a")).unwrap().is_none());
        let out = buffer.insert(1, &frag(1, 5, 1, 3, b"b")).unwrap();
        assert_eq!(out.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn duplicates_are_idempotent() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        assert!(buffer.insert(1, &frag(0, 5, 0, 2, b"xx")).unwrap().is_none());
        // Same fragment again, any number of times
        assert!(buffer.insert(1, &frag(0, 5, 0, 2, b"xx")).unwrap().is_none());
        assert!(buffer.insert(1, &frag(0, 5, 0, 2, b"xx")).unwrap().is_none());
        let out = buffer.insert(1, &frag(1, 5, 1, 2, b"yy")).unwrap();
        assert_eq!(out.unwrap(), Bytes::from_static(b"xxyy"));
    }

    #[test]
    fn padding_truncated_per_fragment() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        // 4 bytes of payload, only 2 real
        let mut frame = frag(0, 6, 0, 2, b"ab__");
        frame.real_len = 2;
        assert!(buffer.insert(1, &frame).unwrap().is_none());
        let mut frame = frag(1, 6, 1, 2, b"cd__");
        frame.real_len = 2;
        let out = buffer.insert(1, &frame).unwrap();
        assert_eq!(out.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[test]
    fn senders_are_isolated() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        assert!(buffer.insert(1, &frag(0, 5, 0, 2, b"a")).unwrap().is_none());
        // Same group id from another sender must not complete the first
        assert!(buffer.insert(2, &frag(0, 5, 1, 2, b"b")).unwrap().is_none());
        assert_eq!(buffer.pending(), 2);
    }

    #[test]
    fn stale_groups_evicted() {
        let mut buffer = FragmentBuffer::new(Duration::from_millis(10));
        assert!(buffer.insert(1, &frag(0, 5, 0, 2, b"a")).unwrap().is_none());
        assert_eq!(buffer.pending(), 1);
        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(buffer.sweep(later), 1);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn frag_total_mismatch_rejected() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        assert!(buffer.insert(1, &frag(0, 5, 0, 3, b"a")).unwrap().is_none());
        assert!(buffer.insert(1, &frag(1, 5, 1, 4, b"b")).is_err());
    }

    #[test]
    fn large_message_reassembles_exactly() {
        let mut buffer = FragmentBuffer::new(Duration::from_secs(30));
        let original: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
        let chunk = 1200;
        let total = original.len().div_ceil(chunk) as u16;
        let mut result = None;
        for (i, piece) in original.chunks(chunk).enumerate() {
            result = buffer.insert(1, &frag(i as u32, 7, i as u16, total, piece)).unwrap();
        }
        assert_eq!(result.unwrap(), Bytes::from(original));
    }
}
