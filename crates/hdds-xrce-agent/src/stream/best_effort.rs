// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Best-effort streams.
//!
//! No acknowledgements and no retransmission. The receiver drops frames
//! that are not newer than the last one it saw and accepts gaps silently.

use std::time::Instant;

use super::fragment::{split_message, FrameLimits, Reassembler};
use super::{OutboundFrame, Outbox, SeqRange, StreamEvent, StreamId, StreamState};
use crate::config::StreamConfig;
use crate::error::XrceError;
use crate::protocol::FrameBody;
use crate::seq::SeqNum;

/// Sender half of a best-effort stream.
#[derive(Debug)]
pub struct BestEffortOutputStream {
    id: StreamId,
    state: StreamState,
    next_seq: SeqNum,
}

impl BestEffortOutputStream {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            state: StreamState::Uninitialized,
            next_seq: SeqNum::ZERO,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    /// Number and transmit a message right away.
    pub fn enqueue(
        &mut self,
        message: &[u8],
        limits: FrameLimits,
        out: &mut Outbox,
    ) -> Result<SeqRange, XrceError> {
        let parts = split_message(message, limits)?;
        self.state = StreamState::Active;
        let range = SeqRange {
            first: self.next_seq,
            count: parts.len() as u16,
        };
        for (flags, payload) in parts {
            out.frames.push(OutboundFrame {
                stream_id: self.id,
                seq: self.next_seq,
                flags,
                payload,
            });
            self.next_seq = self.next_seq.next();
        }
        Ok(range)
    }

    pub fn reset(&mut self) {
        self.next_seq = SeqNum::ZERO;
    }
}

/// Receiver half of a best-effort stream.
#[derive(Debug)]
pub struct BestEffortInputStream {
    id: StreamId,
    state: StreamState,
    last_received: Option<SeqNum>,
    reassembler: Reassembler,
}

impl BestEffortInputStream {
    pub fn new(id: StreamId, config: &StreamConfig) -> Self {
        Self {
            id,
            state: StreamState::Uninitialized,
            last_received: None,
            reassembler: Reassembler::new(config.max_message_size, config.reassembly_timeout),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn last_received(&self) -> Option<SeqNum> {
        self.last_received
    }

    pub fn on_frame(&mut self, seq: SeqNum, body: FrameBody<'_>, now: Instant, out: &mut Outbox) {
        if let Some(last) = self.last_received {
            if !seq.follows(last) {
                tracing::trace!(stream = %self.id, %seq, %last, "stale best-effort frame");
                out.duplicates += 1;
                return;
            }
        }
        self.state = StreamState::Active;
        self.last_received = Some(seq);
        match self.reassembler.accept(seq, body.flags, body.data, now) {
            Ok(Some(message)) => out.delivered.push((self.id, message)),
            Ok(None) => {}
            Err(e) => out.violation(self.id, e.to_string()),
        }
        out.discarded_messages += self.reassembler.take_discarded();
    }

    /// Drop a stale partial message. The stream itself keeps running.
    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        if let Some(first_seq) = self.reassembler.expire(now) {
            tracing::debug!(stream = %self.id, %first_seq, "best-effort reassembly timeout");
            out.events.push(StreamEvent::ReassemblyTimeout {
                stream_id: self.id,
                first_seq,
            });
        }
        out.discarded_messages += self.reassembler.take_discarded();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.reassembler.deadline()
    }

    pub fn reset(&mut self) {
        self.last_received = None;
        self.reassembler.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FragmentFlags;
    use std::time::Duration;

    fn whole(data: &[u8]) -> FrameBody<'_> {
        FrameBody {
            flags: FragmentFlags::Unfragmented,
            data,
        }
    }

    #[test]
    fn test_output_numbers_sequentially() {
        let mut s = BestEffortOutputStream::new(StreamId(1));
        let mut out = Outbox::new();
        let limits = FrameLimits { whole: 4, chunk: 4 };
        s.enqueue(b"ab", limits, &mut out).unwrap();
        let r = s.enqueue(b"0123456789", limits, &mut out).unwrap();
        assert_eq!(r.first, SeqNum::new(1));
        assert_eq!(r.count, 3);
        assert_eq!(s.next_seq(), SeqNum::new(4));
        assert_eq!(out.frames.len(), 4);
    }

    #[test]
    fn test_input_tolerates_gaps_drops_stale() {
        let now = Instant::now();
        let mut s = BestEffortInputStream::new(StreamId(1), &StreamConfig::default());
        let mut out = Outbox::new();
        s.on_frame(SeqNum::new(0), whole(b"a"), now, &mut out);
        s.on_frame(SeqNum::new(3), whole(b"b"), now, &mut out);
        s.on_frame(SeqNum::new(2), whole(b"late"), now, &mut out);
        s.on_frame(SeqNum::new(3), whole(b"dup"), now, &mut out);
        let got: Vec<&[u8]> = out.delivered.iter().map(|(_, m)| m.as_slice()).collect();
        assert_eq!(got, vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(out.duplicates, 2);
        assert!(out.control.is_empty());
    }

    #[test]
    fn test_lost_fragment_discards_message() {
        let now = Instant::now();
        let mut s = BestEffortInputStream::new(StreamId(1), &StreamConfig::default());
        let mut out = Outbox::new();
        let first = FrameBody {
            flags: FragmentFlags::More,
            data: b"he",
        };
        let last = FrameBody {
            flags: FragmentFlags::Last,
            data: b"o",
        };
        s.on_frame(SeqNum::new(0), first, now, &mut out);
        s.on_frame(SeqNum::new(2), last, now, &mut out);
        s.on_frame(SeqNum::new(3), whole(b"next"), now, &mut out);
        let got: Vec<&[u8]> = out.delivered.iter().map(|(_, m)| m.as_slice()).collect();
        assert_eq!(got, vec![&b"next"[..]]);
        assert_eq!(out.discarded_messages, 1);
    }

    #[test]
    fn test_reassembly_timeout_keeps_stream_active() {
        let t0 = Instant::now();
        let config = StreamConfig {
            reassembly_timeout: Duration::from_millis(10),
            ..StreamConfig::default()
        };
        let mut s = BestEffortInputStream::new(StreamId(1), &config);
        let mut out = Outbox::new();
        let first = FrameBody {
            flags: FragmentFlags::More,
            data: b"x",
        };
        s.on_frame(SeqNum::new(0), first, t0, &mut out);
        s.on_tick(t0 + Duration::from_millis(10), &mut out);
        assert!(matches!(
            out.events[0],
            StreamEvent::ReassemblyTimeout { .. }
        ));
        assert_eq!(s.state(), StreamState::Active);
    }
}
