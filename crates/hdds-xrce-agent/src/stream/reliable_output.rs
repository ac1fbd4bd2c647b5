// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable output stream: windowed ARQ sender.
//!
//! Sequence numbers are assigned when a message is enqueued. Frames within
//! the window are transmitted immediately and kept until a cumulative ACKNACK
//! covers them; everything else waits in a bounded backlog.
//!
//! Ack convention: `first_unacked` is the lowest sequence number the peer
//! still needs, so every frame strictly before it is released.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::fragment::{split_message, FrameLimits};
use super::{ControlRecord, OutboundFrame, Outbox, SeqRange, StreamEvent, StreamId, StreamState};
use crate::config::StreamConfig;
use crate::error::XrceError;
use crate::protocol::{AcknackPayload, FragmentFlags, HeartbeatPayload};
use crate::seq::SeqNum;

#[derive(Debug)]
struct InFlight {
    seq: SeqNum,
    flags: FragmentFlags,
    payload: Vec<u8>,
    deadline: Instant,
    retries: u32,
}

#[derive(Debug)]
struct Pending {
    flags: FragmentFlags,
    payload: Vec<u8>,
}

/// Sender half of a reliable stream.
#[derive(Debug)]
pub struct ReliableOutputStream {
    id: StreamId,
    state: StreamState,
    window_size: usize,
    backlog_capacity: usize,
    retransmit_timeout: Duration,
    heartbeat_period: Duration,
    max_retries: u32,
    /// Highest sequence number acknowledged by the peer.
    last_acknowledged: SeqNum,
    /// Sequence number the next frame leaving the backlog receives.
    next_to_send: SeqNum,
    /// Contiguous run `last_acknowledged + 1 .. next_to_send`.
    window: VecDeque<InFlight>,
    backlog: VecDeque<Pending>,
    next_heartbeat: Option<Instant>,
}

impl ReliableOutputStream {
    pub fn new(id: StreamId, config: &StreamConfig) -> Self {
        Self {
            id,
            state: StreamState::Uninitialized,
            window_size: usize::from(config.window_size),
            backlog_capacity: config.send_queue_capacity,
            retransmit_timeout: config.retransmit_timeout,
            heartbeat_period: config.heartbeat_period,
            max_retries: config.max_retries,
            last_acknowledged: SeqNum::ZERO.prev(),
            next_to_send: SeqNum::ZERO,
            window: VecDeque::new(),
            backlog: VecDeque::new(),
            next_heartbeat: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn last_acknowledged(&self) -> SeqNum {
        self.last_acknowledged
    }

    pub fn next_to_send(&self) -> SeqNum {
        self.next_to_send
    }

    /// Frames sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    /// Frames waiting for window space.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Queue a logical message. Frames that fit in the window are pushed to
    /// `out` right away.
    pub fn enqueue(
        &mut self,
        message: &[u8],
        limits: FrameLimits,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<SeqRange, XrceError> {
        if self.state == StreamState::Suspended {
            return Err(XrceError::StreamSuspended(self.id));
        }
        let parts = split_message(message, limits)?;
        let capacity = self.window_size + self.backlog_capacity;
        if parts.len() > capacity {
            return Err(XrceError::PayloadTooLarge {
                size: message.len(),
                limit: capacity * limits.chunk,
            });
        }
        let free = (self.window_size - self.window.len()) + (self.backlog_capacity - self.backlog.len());
        if parts.len() > free {
            return Err(XrceError::WouldBlock);
        }

        self.state = StreamState::Active;
        let range = SeqRange {
            first: self.next_to_send.add(self.backlog.len() as u16),
            count: parts.len() as u16,
        };
        self.backlog
            .extend(parts.into_iter().map(|(flags, payload)| Pending { flags, payload }));
        self.drain_backlog(now, out);
        Ok(range)
    }

    /// Move backlog frames into the window while it has room.
    fn drain_backlog(&mut self, now: Instant, out: &mut Outbox) {
        while self.window.len() < self.window_size {
            let Some(pending) = self.backlog.pop_front() else {
                break;
            };
            let seq = self.next_to_send;
            self.next_to_send = seq.next();
            out.frames.push(OutboundFrame {
                stream_id: self.id,
                seq,
                flags: pending.flags,
                payload: pending.payload.clone(),
            });
            self.window.push_back(InFlight {
                seq,
                flags: pending.flags,
                payload: pending.payload,
                deadline: now + self.retransmit_timeout,
                retries: 0,
            });
        }
        if !self.window.is_empty() && self.next_heartbeat.is_none() {
            self.next_heartbeat = Some(now + self.heartbeat_period);
        }
    }

    /// Apply a peer ACKNACK: release acknowledged frames, retransmit the
    /// ones flagged missing and refill the window.
    pub fn on_acknack(&mut self, ack: &AcknackPayload, now: Instant, out: &mut Outbox) {
        if self.state != StreamState::Active {
            tracing::debug!(stream = %self.id, state = ?self.state, "acknack ignored");
            return;
        }
        let first = ack.first_unacked;
        let window_start = self.last_acknowledged.next();
        if !first.within(window_start, self.next_to_send) {
            if first.precedes(window_start) {
                tracing::trace!(stream = %self.id, %first, "stale acknack");
            } else {
                out.violation(
                    self.id,
                    format!("acknack {} beyond next_to_send {}", first, self.next_to_send),
                );
            }
            return;
        }

        while self.window.front().is_some_and(|f| f.seq.precedes(first)) {
            self.window.pop_front();
        }
        self.last_acknowledged = first.prev();

        for seq in ack.missing() {
            let offset = usize::from(first.distance_to(seq));
            let Some(frame) = self.window.get_mut(offset) else {
                continue;
            };
            tracing::trace!(stream = %self.id, %seq, "nack retransmit");
            frame.deadline = now + self.retransmit_timeout;
            out.retransmissions += 1;
            out.frames.push(OutboundFrame {
                stream_id: self.id,
                seq: frame.seq,
                flags: frame.flags,
                payload: frame.payload.clone(),
            });
        }

        self.drain_backlog(now, out);
        if self.window.is_empty() {
            self.next_heartbeat = None;
        }
    }

    /// Fire expired retransmission and heartbeat timers.
    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        if self.state != StreamState::Active {
            return;
        }

        for i in 0..self.window.len() {
            let frame = &mut self.window[i];
            if frame.deadline > now {
                continue;
            }
            if frame.retries >= self.max_retries {
                let seq = frame.seq;
                tracing::warn!(stream = %self.id, %seq, retries = self.max_retries, "peer unresponsive");
                self.state = StreamState::Suspended;
                self.next_heartbeat = None;
                out.events.push(StreamEvent::PeerUnresponsive {
                    stream_id: self.id,
                    seq,
                });
                out.events.push(StreamEvent::Suspended { stream_id: self.id });
                return;
            }
            frame.retries += 1;
            frame.deadline = now + self.retransmit_timeout;
            out.retransmissions += 1;
            out.frames.push(OutboundFrame {
                stream_id: self.id,
                seq: frame.seq,
                flags: frame.flags,
                payload: frame.payload.clone(),
            });
        }

        if self.next_heartbeat.is_some_and(|at| at <= now) {
            self.next_heartbeat = if self.window.is_empty() {
                None
            } else {
                out.control.push(ControlRecord::Heartbeat(self.heartbeat()));
                Some(now + self.heartbeat_period)
            };
        }
    }

    /// Range of sequence numbers still awaiting acknowledgement.
    pub fn heartbeat(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            first_unacked: self.last_acknowledged.next(),
            last_unacked: self.next_to_send.prev(),
            stream_id: self.id.0,
        }
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != StreamState::Active {
            return None;
        }
        let retransmit = self.window.iter().map(|f| f.deadline).min();
        match (retransmit, self.next_heartbeat) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Restart the sequence space and drop everything queued.
    pub fn reset(&mut self) {
        self.last_acknowledged = SeqNum::ZERO.prev();
        self.next_to_send = SeqNum::ZERO;
        self.window.clear();
        self.backlog.clear();
        self.next_heartbeat = None;
        if self.state == StreamState::Suspended {
            self.state = StreamState::Active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: FrameLimits = FrameLimits {
        whole: 64,
        chunk: 32,
    };

    fn config(window: u16, backlog: usize) -> StreamConfig {
        StreamConfig {
            window_size: window,
            send_queue_capacity: backlog,
            retransmit_timeout: Duration::from_millis(100),
            heartbeat_period: Duration::from_millis(50),
            max_retries: 2,
            ..StreamConfig::default()
        }
    }

    fn stream(window: u16, backlog: usize) -> ReliableOutputStream {
        ReliableOutputStream::new(StreamId(0x80), &config(window, backlog))
    }

    fn ack(first: u16, bitmap: u16) -> AcknackPayload {
        AcknackPayload {
            first_unacked: SeqNum::new(first),
            nack_bitmap: bitmap,
            stream_id: 0x80,
        }
    }

    fn seqs(out: &Outbox) -> Vec<u16> {
        out.frames.iter().map(|f| f.seq.raw()).collect()
    }

    #[test]
    fn test_window_then_backlog() {
        let now = Instant::now();
        let mut s = stream(2, 4);
        let mut out = Outbox::new();
        for _ in 0..3 {
            s.enqueue(b"msg", LIMITS, now, &mut out).unwrap();
        }
        assert_eq!(seqs(&out), vec![0, 1]);
        assert_eq!(s.in_flight(), 2);
        assert_eq!(s.backlog_len(), 1);
        assert_eq!(s.state(), StreamState::Active);
    }

    #[test]
    fn test_full_backlog_would_block() {
        let now = Instant::now();
        let mut s = stream(1, 1);
        let mut out = Outbox::new();
        s.enqueue(b"a", LIMITS, now, &mut out).unwrap();
        s.enqueue(b"b", LIMITS, now, &mut out).unwrap();
        assert_eq!(
            s.enqueue(b"c", LIMITS, now, &mut out),
            Err(XrceError::WouldBlock)
        );
    }

    #[test]
    fn test_cumulative_ack_releases_and_refills() {
        let now = Instant::now();
        let mut s = stream(2, 4);
        let mut out = Outbox::new();
        for _ in 0..4 {
            s.enqueue(b"m", LIMITS, now, &mut out).unwrap();
        }
        let mut out = Outbox::new();
        s.on_acknack(&ack(2, 0), now, &mut out);
        assert_eq!(s.last_acknowledged(), SeqNum::new(1));
        assert_eq!(seqs(&out), vec![2, 3]);
        assert_eq!(s.backlog_len(), 0);
    }

    #[test]
    fn test_nack_retransmits_only_missing() {
        let now = Instant::now();
        let mut s = stream(8, 8);
        let mut out = Outbox::new();
        for _ in 0..5 {
            s.enqueue(b"m", LIMITS, now, &mut out).unwrap();
        }
        let mut out = Outbox::new();
        // 0 and 1 acked, 2 and 4 missing.
        s.on_acknack(&ack(2, 0b101), now, &mut out);
        assert_eq!(seqs(&out), vec![2, 4]);
        assert_eq!(out.retransmissions, 2);
        assert_eq!(s.in_flight(), 3);
    }

    #[test]
    fn test_ack_beyond_sent_is_violation() {
        let now = Instant::now();
        let mut s = stream(8, 8);
        let mut out = Outbox::new();
        s.enqueue(b"m", LIMITS, now, &mut out).unwrap();
        let mut out = Outbox::new();
        s.on_acknack(&ack(5, 0), now, &mut out);
        assert!(matches!(
            out.events[0],
            StreamEvent::ProtocolViolation { .. }
        ));
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn test_retransmit_then_unresponsive() {
        let t0 = Instant::now();
        let mut s = stream(4, 4);
        let mut out = Outbox::new();
        s.enqueue(b"m", LIMITS, t0, &mut out).unwrap();

        let mut total = 0;
        let mut t = t0;
        for _ in 0..2 {
            t += Duration::from_millis(100);
            let mut out = Outbox::new();
            s.on_tick(t, &mut out);
            total += out.retransmissions;
        }
        assert_eq!(total, 2);
        assert_eq!(s.state(), StreamState::Active);

        let mut out = Outbox::new();
        s.on_tick(t + Duration::from_millis(100), &mut out);
        assert_eq!(s.state(), StreamState::Suspended);
        assert_eq!(
            out.events[0],
            StreamEvent::PeerUnresponsive {
                stream_id: StreamId(0x80),
                seq: SeqNum::ZERO
            }
        );
        assert_eq!(
            s.enqueue(b"x", LIMITS, t, &mut Outbox::new()),
            Err(XrceError::StreamSuspended(StreamId(0x80)))
        );

        s.reset();
        assert_eq!(s.state(), StreamState::Active);
        assert!(s.enqueue(b"x", LIMITS, t, &mut Outbox::new()).is_ok());
    }

    #[test]
    fn test_heartbeat_advertises_unacked_range() {
        let t0 = Instant::now();
        let mut s = stream(4, 4);
        let mut out = Outbox::new();
        s.enqueue(b"a", LIMITS, t0, &mut out).unwrap();
        s.enqueue(b"b", LIMITS, t0, &mut out).unwrap();
        assert_eq!(s.next_deadline(), Some(t0 + Duration::from_millis(50)));

        let mut out = Outbox::new();
        s.on_tick(t0 + Duration::from_millis(50), &mut out);
        assert!(out.frames.is_empty());
        assert_eq!(
            out.control,
            vec![ControlRecord::Heartbeat(HeartbeatPayload {
                first_unacked: SeqNum::new(0),
                last_unacked: SeqNum::new(1),
                stream_id: 0x80,
            })]
        );

        s.on_acknack(&ack(2, 0), t0, &mut Outbox::new());
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn test_fragmented_message_gets_consecutive_seqs() {
        let now = Instant::now();
        let mut s = stream(16, 16);
        let mut out = Outbox::new();
        let range = s.enqueue(&[7u8; 100], LIMITS, now, &mut out).unwrap();
        assert_eq!(range.count, 4);
        assert_eq!(seqs(&out), vec![0, 1, 2, 3]);
        assert_eq!(out.frames[0].flags, FragmentFlags::More);
        assert_eq!(out.frames[3].flags, FragmentFlags::Last);
    }

    #[test]
    fn test_window_survives_wraparound() {
        let now = Instant::now();
        let mut s = stream(4, 0);
        s.last_acknowledged = SeqNum::new(65533);
        s.next_to_send = SeqNum::new(65534);
        let mut out = Outbox::new();
        for _ in 0..4 {
            s.enqueue(b"m", LIMITS, now, &mut out).unwrap();
        }
        assert_eq!(seqs(&out), vec![65534, 65535, 0, 1]);
        let mut out = Outbox::new();
        s.on_acknack(&ack(0, 0b1), now, &mut out);
        assert_eq!(s.last_acknowledged(), SeqNum::new(65535));
        assert_eq!(seqs(&out), vec![0]);
        assert_eq!(s.in_flight(), 2);
    }
}
