// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # XRCE streams
//!
//! A session multiplexes independent logical channels identified by a
//! one-byte [`StreamId`]:
//!
//! | Range | Kind | Delivery |
//! |-------|------|----------|
//! | `0` | none | unsequenced control channel |
//! | `1..=127` | best-effort | newest-wins, gaps tolerated |
//! | `128..=255` | reliable | ordered, loss-free, windowed ARQ |
//!
//! ## Reliable protocol flow
//!
//! ```text
//! Sender (output)                          Receiver (input)
//!   |--- seq=5 ---------------------------->|  deliver 5
//!   |--- seq=6 ---------X (lost)            |
//!   |--- seq=7 ---------------------------->|  buffer 7, gap at 6
//!   |<-- ACKNACK (first=6, bitmap=0b01) ----|
//!   |--- seq=6 [retransmit] --------------->|  deliver 6, 7
//!   |--- HEARTBEAT (first=8, last=8) ------>|  (after a silent loss of 8)
//!   |<-- ACKNACK (first=8, bitmap=0b01) ----|
//! ```
//!
//! Every stream is a plain state machine: callers pass the current time and
//! an [`Outbox`] collecting frames, control records, deliveries and events.
//! No stream ever blocks or spawns.

use std::fmt;

use crate::protocol::{AcknackPayload, FragmentFlags, HeartbeatPayload};
use crate::seq::SeqNum;

mod best_effort;
mod fragment;
mod reliable_input;
mod reliable_output;

pub use best_effort::{BestEffortInputStream, BestEffortOutputStream};
pub use fragment::{split_message, FrameLimits, ReassemblyError, Reassembler};
pub use reliable_input::ReliableInputStream;
pub use reliable_output::ReliableOutputStream;

// ---------------------------------------------------------------------------
// Stream identity
// ---------------------------------------------------------------------------

/// First best-effort stream id.
pub const BEST_EFFORT_STREAM_MIN: u8 = 0x01;
/// First reliable stream id.
pub const RELIABLE_STREAM_MIN: u8 = 0x80;

/// Identifies the stream type by its id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// stream_id == 0: unsequenced.
    None,
    /// stream_id 1..=127: fire-and-forget.
    BestEffort,
    /// stream_id 128..=255: reliable delivery.
    Reliable,
}

/// One-byte stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u8);

impl StreamId {
    /// The unsequenced control stream.
    pub const NONE: StreamId = StreamId(0);

    pub fn kind(self) -> StreamKind {
        match self.0 {
            0 => StreamKind::None,
            BEST_EFFORT_STREAM_MIN..=0x7F => StreamKind::BestEffort,
            RELIABLE_STREAM_MIN..=u8::MAX => StreamKind::Reliable,
        }
    }

    pub fn is_reliable(self) -> bool {
        self.kind() == StreamKind::Reliable
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Per-direction stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but never used.
    Uninitialized,
    Active,
    /// Retry budget exhausted (send) or reassembly timed out (receive).
    /// Cleared only by a session reset.
    Suspended,
}

// ---------------------------------------------------------------------------
// Stream output
// ---------------------------------------------------------------------------

/// A sequenced frame ready to be encoded and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub stream_id: StreamId,
    pub seq: SeqNum,
    pub flags: FragmentFlags,
    /// Whole message body when unfragmented, fragment bytes otherwise.
    pub payload: Vec<u8>,
}

/// Unsequenced control traffic, always sent on stream 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecord {
    Heartbeat(HeartbeatPayload),
    Acknack(AcknackPayload),
}

/// Conditions reported upward. None of them are fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Frame dropped: out-of-window, malformed or inconsistent.
    ProtocolViolation { stream_id: StreamId, reason: String },
    /// A fragment exhausted its retry budget.
    PeerUnresponsive { stream_id: StreamId, seq: SeqNum },
    /// A partial message was discarded after the reassembly timeout.
    ReassemblyTimeout { stream_id: StreamId, first_seq: SeqNum },
    /// The stream entered [`StreamState::Suspended`].
    Suspended { stream_id: StreamId },
}

impl StreamEvent {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::ProtocolViolation { stream_id, .. }
            | Self::PeerUnresponsive { stream_id, .. }
            | Self::ReassemblyTimeout { stream_id, .. }
            | Self::Suspended { stream_id } => *stream_id,
        }
    }
}

/// Collects everything a stream operation produced.
#[derive(Debug, Default)]
pub struct Outbox {
    pub frames: Vec<OutboundFrame>,
    pub control: Vec<ControlRecord>,
    pub delivered: Vec<(StreamId, Vec<u8>)>,
    pub events: Vec<StreamEvent>,
    pub retransmissions: u32,
    pub duplicates: u32,
    /// Partial messages the reassembler gave up on.
    pub discarded_messages: u32,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
            && self.control.is_empty()
            && self.delivered.is_empty()
            && self.events.is_empty()
    }

    pub(crate) fn violation(&mut self, stream_id: StreamId, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(stream = %stream_id, %reason, "frame dropped");
        self.events.push(StreamEvent::ProtocolViolation { stream_id, reason });
    }
}

/// Sequence numbers assigned to one enqueued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub first: SeqNum,
    pub count: u16,
}

impl SeqRange {
    pub fn last(&self) -> SeqNum {
        self.first.add(self.count.saturating_sub(1))
    }

    pub fn iter(&self) -> impl Iterator<Item = SeqNum> {
        let first = self.first;
        (0..self.count).map(move |i| first.add(i))
    }
}
