// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable input stream: in-order delivery with gap tracking.
//!
//! Frames at `next_expected` are delivered at once together with any
//! buffered run that follows. Frames ahead of it but inside the window are
//! buffered and answered with an immediate ACKNACK naming the gaps. In-order
//! traffic only marks an acknowledgement as pending; it goes out on the
//! acknack period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::fragment::Reassembler;
use super::{ControlRecord, Outbox, StreamEvent, StreamId, StreamState};
use crate::config::StreamConfig;
use crate::protocol::{AcknackPayload, FragmentFlags, FrameBody, HeartbeatPayload};
use crate::seq::SeqNum;

/// Width of the ACKNACK nack bitmap.
const NACK_BITMAP_BITS: u16 = 16;

#[derive(Debug)]
struct Buffered {
    flags: FragmentFlags,
    payload: Vec<u8>,
}

/// Receiver half of a reliable stream.
#[derive(Debug)]
pub struct ReliableInputStream {
    id: StreamId,
    state: StreamState,
    window_size: u16,
    acknack_period: Duration,
    next_expected: SeqNum,
    /// Highest sequence number the peer is known to have sent.
    highest_known: SeqNum,
    buffer: HashMap<SeqNum, Buffered>,
    reassembler: Reassembler,
    next_acknack: Option<Instant>,
}

impl ReliableInputStream {
    pub fn new(id: StreamId, config: &StreamConfig) -> Self {
        Self {
            id,
            state: StreamState::Uninitialized,
            window_size: config.window_size.min(NACK_BITMAP_BITS),
            acknack_period: config.acknack_period,
            next_expected: SeqNum::ZERO,
            highest_known: SeqNum::ZERO.prev(),
            buffer: HashMap::new(),
            reassembler: Reassembler::new(config.max_message_size, config.reassembly_timeout),
            next_acknack: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn next_expected(&self) -> SeqNum {
        self.next_expected
    }

    /// Out-of-order frames waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn ack_pending(&self) -> bool {
        self.next_acknack.is_some()
    }

    pub fn on_frame(&mut self, seq: SeqNum, body: FrameBody<'_>, now: Instant, out: &mut Outbox) {
        if self.state == StreamState::Suspended {
            tracing::trace!(stream = %self.id, %seq, "frame on suspended stream dropped");
            return;
        }
        self.state = StreamState::Active;

        if seq == self.next_expected {
            self.deliver(seq, body.flags, body.data, now, out);
            self.next_expected = seq.next();
            while let Some(held) = self.buffer.remove(&self.next_expected) {
                let held_seq = self.next_expected;
                self.deliver(held_seq, held.flags, &held.payload, now, out);
                self.next_expected = held_seq.next();
            }
            if self.highest_known.precedes(self.next_expected.prev()) {
                self.highest_known = self.next_expected.prev();
            }
            if self.next_acknack.is_none() {
                self.next_acknack = Some(now + self.acknack_period);
            }
            return;
        }

        if seq.precedes(self.next_expected) {
            tracing::trace!(stream = %self.id, %seq, "duplicate frame");
            out.duplicates += 1;
            self.send_acknack(out);
            return;
        }

        let ahead = self.next_expected.distance_to(seq);
        if ahead >= self.window_size {
            out.violation(
                self.id,
                format!(
                    "seq {} outside window [{}, +{})",
                    seq, self.next_expected, self.window_size
                ),
            );
            return;
        }

        if self.buffer.contains_key(&seq) {
            out.duplicates += 1;
        } else {
            self.buffer.insert(
                seq,
                Buffered {
                    flags: body.flags,
                    payload: body.data.to_vec(),
                },
            );
            if seq.follows(self.highest_known) {
                self.highest_known = seq;
            }
        }
        self.send_acknack(out);
    }

    fn deliver(
        &mut self,
        seq: SeqNum,
        flags: FragmentFlags,
        data: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) {
        match self.reassembler.accept(seq, flags, data, now) {
            Ok(Some(message)) => out.delivered.push((self.id, message)),
            Ok(None) => {}
            Err(e) => out.violation(self.id, e.to_string()),
        }
        out.discarded_messages += self.reassembler.take_discarded();
    }

    /// Peer heartbeat: if it has sent past what we hold, ask right away.
    pub fn on_heartbeat(&mut self, hb: &HeartbeatPayload, now: Instant, out: &mut Outbox) {
        if self.state == StreamState::Suspended {
            return;
        }
        self.state = StreamState::Active;

        // Empty range: nothing in flight on the peer side.
        if hb.last_unacked.precedes(hb.first_unacked) {
            return;
        }
        if hb.last_unacked.follows(self.highest_known) {
            let limit = self.next_expected.add(self.window_size - 1);
            self.highest_known = if hb.last_unacked.follows(limit) {
                limit
            } else {
                hb.last_unacked
            };
        }
        if !hb.last_unacked.precedes(self.next_expected) {
            self.send_acknack(out);
        } else if self.next_acknack.is_none() {
            self.next_acknack = Some(now + self.acknack_period);
        }
    }

    /// Current cumulative ack with the missing frames flagged.
    pub fn acknack(&self) -> AcknackPayload {
        // Sequence numbers from next_expected through highest_known.
        let known = if self.highest_known.precedes(self.next_expected) {
            0
        } else {
            self.next_expected.distance_to(self.highest_known) + 1
        };
        let mut bitmap = 0u16;
        for bit in 0..self.window_size.min(known) {
            if !self.buffer.contains_key(&self.next_expected.add(bit)) {
                bitmap |= 1 << bit;
            }
        }
        AcknackPayload {
            first_unacked: self.next_expected,
            nack_bitmap: bitmap,
            stream_id: self.id.0,
        }
    }

    fn send_acknack(&mut self, out: &mut Outbox) {
        out.control.push(ControlRecord::Acknack(self.acknack()));
        self.next_acknack = None;
    }

    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        if self.state != StreamState::Active {
            return;
        }
        if let Some(first_seq) = self.reassembler.expire(now) {
            out.discarded_messages += self.reassembler.take_discarded();
            tracing::warn!(stream = %self.id, %first_seq, "reassembly timeout");
            self.state = StreamState::Suspended;
            self.buffer.clear();
            self.next_acknack = None;
            out.events.push(StreamEvent::ReassemblyTimeout {
                stream_id: self.id,
                first_seq,
            });
            out.events.push(StreamEvent::Suspended { stream_id: self.id });
            return;
        }
        if self.next_acknack.is_some_and(|at| at <= now) {
            self.send_acknack(out);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != StreamState::Active {
            return None;
        }
        match (self.reassembler.deadline(), self.next_acknack) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn reset(&mut self) {
        self.next_expected = SeqNum::ZERO;
        self.highest_known = SeqNum::ZERO.prev();
        self.buffer.clear();
        self.reassembler.clear();
        self.next_acknack = None;
        if self.state == StreamState::Suspended {
            self.state = StreamState::Active;
        }
    }
}
