// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragmentation and reassembly.
//!
//! A logical message larger than one frame is split into FRAGMENT
//! submessages on consecutive sequence numbers. Only the last one carries a
//! flag, so a run begins with the first fragment after a complete message.
//! The reliable input stream guarantees contiguity. The best-effort one does
//! not: after a gap the reassembler cannot tell where the next message
//! starts, so it skips fragments up to the next LAST.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::XrceError;
use crate::protocol::FragmentFlags;
use crate::seq::SeqNum;

// ---------------------------------------------------------------------------
// Fragmentation
// ---------------------------------------------------------------------------

/// Payload budget of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest body sent unfragmented.
    pub whole: usize,
    /// Largest fragment payload (FRAGMENT submessage header excluded).
    pub chunk: usize,
}

/// Split a message body into frame payloads.
pub fn split_message(
    data: &[u8],
    limits: FrameLimits,
) -> Result<Vec<(FragmentFlags, Vec<u8>)>, XrceError> {
    if data.is_empty() {
        return Err(XrceError::violation("empty message"));
    }
    if limits.chunk == 0 {
        return Err(XrceError::Config("frame too small for fragments".into()));
    }
    if data.len() <= limits.whole {
        return Ok(vec![(FragmentFlags::Unfragmented, data.to_vec())]);
    }

    let total = data.len().div_ceil(limits.chunk);
    if total > usize::from(u16::MAX / 2) {
        return Err(XrceError::PayloadTooLarge {
            size: data.len(),
            limit: limits.chunk * usize::from(u16::MAX / 2),
        });
    }

    let mut out = Vec::with_capacity(total);
    for (i, chunk) in data.chunks(limits.chunk).enumerate() {
        let flags = if i + 1 == total {
            FragmentFlags::Last
        } else {
            FragmentFlags::More
        };
        out.push((flags, chunk.to_vec()));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Fragments the reassembler refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// Assembly grew past the configured message limit and was dropped.
    #[error("message starting at seq {first_seq} exceeds {limit} bytes")]
    TooLarge { first_seq: SeqNum, limit: usize },
}

#[derive(Debug)]
struct Assembly {
    /// Sequence number of the first fragment.
    first_seq: SeqNum,
    data: Vec<u8>,
    started: Instant,
}

/// Rebuilds one logical message at a time from an ordered fragment run.
#[derive(Debug)]
pub struct Reassembler {
    open: Option<Assembly>,
    /// Sequence number that continues the current run.
    expected: SeqNum,
    /// A gap hid the start of a message; drop fragments through its LAST.
    skipping: bool,
    max_message_size: usize,
    timeout: Duration,
    discarded: u32,
}

impl Reassembler {
    pub fn new(max_message_size: usize, timeout: Duration) -> Self {
        Self {
            open: None,
            expected: SeqNum::ZERO,
            skipping: false,
            max_message_size,
            timeout,
            discarded: 0,
        }
    }

    /// Feed one frame. Returns the completed message, exactly once, when
    /// the LAST fragment closes a gap-free run.
    pub fn accept(
        &mut self,
        seq: SeqNum,
        flags: FragmentFlags,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        let gap = seq != self.expected;
        self.expected = seq.next();

        if let Some(open) = &self.open {
            if gap || flags == FragmentFlags::Unfragmented {
                tracing::debug!(
                    first_seq = %open.first_seq,
                    %seq,
                    "partial message discarded"
                );
                self.open = None;
                self.discarded += 1;
                self.skipping = flags != FragmentFlags::Unfragmented;
            }
        } else if gap && flags != FragmentFlags::Unfragmented && !self.skipping {
            tracing::debug!(%seq, "fragment after a gap, skipping to the next message");
            self.discarded += 1;
            self.skipping = true;
        }

        match flags {
            FragmentFlags::Unfragmented => {
                self.skipping = false;
                if payload.len() > self.max_message_size {
                    return Err(ReassemblyError::TooLarge {
                        first_seq: seq,
                        limit: self.max_message_size,
                    });
                }
                Ok(Some(payload.to_vec()))
            }
            FragmentFlags::More | FragmentFlags::Last if self.skipping => {
                if flags == FragmentFlags::Last {
                    self.skipping = false;
                }
                Ok(None)
            }
            FragmentFlags::More | FragmentFlags::Last => {
                let open = self.open.get_or_insert_with(|| Assembly {
                    first_seq: seq,
                    data: Vec::new(),
                    started: now,
                });
                if open.data.len() + payload.len() > self.max_message_size {
                    let first_seq = open.first_seq;
                    self.open = None;
                    self.discarded += 1;
                    self.skipping = flags == FragmentFlags::More;
                    return Err(ReassemblyError::TooLarge {
                        first_seq,
                        limit: self.max_message_size,
                    });
                }
                open.data.extend_from_slice(payload);
                if flags == FragmentFlags::Last {
                    Ok(self.open.take().map(|a| a.data))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Discard the open assembly if it is older than the timeout.
    /// Returns the key of the discarded assembly.
    pub fn expire(&mut self, now: Instant) -> Option<SeqNum> {
        let open = self.open.as_ref()?;
        if now.saturating_duration_since(open.started) < self.timeout {
            return None;
        }
        let first_seq = open.first_seq;
        self.open = None;
        self.discarded += 1;
        self.skipping = true;
        Some(first_seq)
    }

    /// When the open assembly times out, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().map(|a| a.started + self.timeout)
    }

    /// Key of the open assembly, if any.
    pub fn open_assembly(&self) -> Option<SeqNum> {
        self.open.as_ref().map(|a| a.first_seq)
    }

    /// Partial messages dropped since the last call (gaps, interruptions,
    /// oversize, timeouts).
    pub fn take_discarded(&mut self) -> u32 {
        std::mem::take(&mut self.discarded)
    }

    /// Forget any partial message and restart at sequence number zero.
    pub fn clear(&mut self) {
        self.open = None;
        self.expected = SeqNum::ZERO;
        self.skipping = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: FrameLimits = FrameLimits { whole: 8, chunk: 4 };

    fn reassembler() -> Reassembler {
        Reassembler::new(1024, Duration::from_millis(100))
    }

    #[test]
    fn test_small_message_unfragmented() {
        let parts = split_message(&[1, 2, 3], LIMITS).unwrap();
        assert_eq!(parts, vec![(FragmentFlags::Unfragmented, vec![1, 2, 3])]);
    }

    #[test]
    fn test_split_flags() {
        let data: Vec<u8> = (0..10).collect();
        let parts = split_message(&data, LIMITS).unwrap();
        let flags: Vec<FragmentFlags> = parts.iter().map(|p| p.0).collect();
        assert_eq!(
            flags,
            vec![FragmentFlags::More, FragmentFlags::More, FragmentFlags::Last]
        );
        assert_eq!(parts[2].1, vec![8, 9]);
    }

    #[test]
    fn test_split_rejects_empty() {
        assert!(split_message(&[], LIMITS).is_err());
    }

    #[test]
    fn test_reassembly_byte_identical() {
        let now = Instant::now();
        for len in [9usize, 12, 13, 100] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let parts = split_message(&data, LIMITS).unwrap();
            let mut r = reassembler();
            let mut seq = SeqNum::ZERO;
            let mut out = None;
            for (i, (flags, chunk)) in parts.iter().enumerate() {
                let res = r.accept(seq, *flags, chunk, now).unwrap();
                if i + 1 < parts.len() {
                    assert!(res.is_none());
                } else {
                    out = res;
                }
                seq = seq.next();
            }
            assert_eq!(out.as_deref(), Some(&data[..]));
            assert!(r.open_assembly().is_none());
        }
    }

    #[test]
    fn test_run_opens_on_first_fragment_after_message() {
        let now = Instant::now();
        let mut r = reassembler();
        assert_eq!(
            r.accept(SeqNum::new(0), FragmentFlags::Unfragmented, b"a", now),
            Ok(Some(b"a".to_vec()))
        );
        assert_eq!(r.accept(SeqNum::new(1), FragmentFlags::More, b"hel", now), Ok(None));
        assert_eq!(r.open_assembly(), Some(SeqNum::new(1)));
        assert_eq!(
            r.accept(SeqNum::new(2), FragmentFlags::Last, b"lo", now),
            Ok(Some(b"hello".to_vec()))
        );
        // A lone LAST is a one-fragment message.
        assert_eq!(
            r.accept(SeqNum::new(3), FragmentFlags::Last, b"z", now),
            Ok(Some(b"z".to_vec()))
        );
        assert_eq!(r.take_discarded(), 0);
    }

    #[test]
    fn test_gap_discards_partial_and_skips_to_last() {
        let now = Instant::now();
        let mut r = reassembler();
        r.accept(SeqNum::new(0), FragmentFlags::More, &[1], now).unwrap();
        // seq 1 lost: 2 and 3 belong to the broken message.
        assert_eq!(r.accept(SeqNum::new(2), FragmentFlags::More, &[3], now), Ok(None));
        assert_eq!(r.accept(SeqNum::new(3), FragmentFlags::Last, &[4], now), Ok(None));
        assert!(r.open_assembly().is_none());
        assert_eq!(r.take_discarded(), 1);
        assert_eq!(r.accept(SeqNum::new(4), FragmentFlags::More, &[5], now), Ok(None));
        assert_eq!(
            r.accept(SeqNum::new(5), FragmentFlags::Last, &[6], now),
            Ok(Some(vec![5, 6]))
        );
    }

    #[test]
    fn test_fragment_after_gap_is_not_a_message_start() {
        let now = Instant::now();
        let mut r = reassembler();
        r.accept(SeqNum::new(0), FragmentFlags::Unfragmented, &[0], now).unwrap();
        // seq 1 lost: it may have been the first fragment of 2..=3.
        assert_eq!(r.accept(SeqNum::new(2), FragmentFlags::More, &[2], now), Ok(None));
        assert_eq!(r.accept(SeqNum::new(3), FragmentFlags::Last, &[3], now), Ok(None));
        assert_eq!(r.take_discarded(), 1);
        assert_eq!(
            r.accept(SeqNum::new(4), FragmentFlags::Unfragmented, &[4], now),
            Ok(Some(vec![4]))
        );
    }

    #[test]
    fn test_unfragmented_frame_interrupts_run() {
        let now = Instant::now();
        let mut r = reassembler();
        r.accept(SeqNum::new(0), FragmentFlags::More, &[1], now).unwrap();
        let msg = r
            .accept(SeqNum::new(1), FragmentFlags::Unfragmented, &[2], now)
            .unwrap();
        assert_eq!(msg, Some(vec![2]));
        assert_eq!(r.take_discarded(), 1);
        assert_eq!(
            r.accept(SeqNum::new(2), FragmentFlags::Last, &[3], now),
            Ok(Some(vec![3]))
        );
    }

    #[test]
    fn test_timeout_discards() {
        let t0 = Instant::now();
        let mut r = reassembler();
        r.accept(SeqNum::new(0), FragmentFlags::More, &[1], t0).unwrap();
        assert_eq!(r.deadline(), Some(t0 + Duration::from_millis(100)));
        assert_eq!(r.expire(t0 + Duration::from_millis(50)), None);
        assert_eq!(
            r.expire(t0 + Duration::from_millis(100)),
            Some(SeqNum::new(0))
        );
        assert!(r.open_assembly().is_none());
        assert_eq!(r.deadline(), None);
    }

    #[test]
    fn test_oversized_assembly_rejected() {
        let now = Instant::now();
        let mut r = Reassembler::new(4, Duration::from_secs(1));
        r.accept(SeqNum::new(0), FragmentFlags::More, &[0; 3], now).unwrap();
        let err = r
            .accept(SeqNum::new(1), FragmentFlags::More, &[0; 3], now)
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::TooLarge { .. }));
        assert!(r.open_assembly().is_none());
    }
}
