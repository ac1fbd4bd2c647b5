// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// XRCE session state machine.
//
// A `Session` owns every stream of one client and is driven by a single
// worker: inbound datagrams, outbound messages and timer ticks all go
// through `&mut self` with the current time passed in. It never performs
// I/O itself; encoded datagrams are handed back in a `SessionOutput`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{StreamConfig, MIN_FRAME_SIZE};
use crate::error::XrceError;
use crate::protocol::{
    begin_message, decode_frame_body, parse_submessages, write_acknack, write_fragment,
    write_heartbeat, write_status, write_status_agent, ClientKey, CreateClientPayload,
    Endianness, FragmentFlags, MessageHeader, StatusCode, StatusPayload, Submessage,
    CLIENT_OBJECT_ID, SESSION_ID_NONE_WITHOUT_CLIENT_KEY,
    SESSION_ID_NONE_WITH_CLIENT_KEY, SUBMESSAGE_HEADER_SIZE,
};
use crate::seq::SeqNum;
use crate::stats::SessionStats;
use crate::stream::{
    BestEffortInputStream, BestEffortOutputStream, ControlRecord, FrameLimits, OutboundFrame,
    Outbox, ReliableInputStream, ReliableOutputStream, SeqRange, StreamEvent, StreamId,
    StreamKind, StreamState,
};
use crate::transport::TransportAddr;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of one client session: the client key plus the session id the
/// client chose in CREATE_CLIENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub client_key: ClientKey,
    pub session_id: u8,
}

impl SessionId {
    pub fn new(client_key: ClientKey, session_id: u8) -> Self {
        Self {
            client_key,
            session_id,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02x}", self.client_key, self.session_id)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Everything one session operation produced.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Encoded messages to send to the client, in order.
    pub datagrams: Vec<Vec<u8>>,
    /// Complete logical messages for the object-model router.
    pub delivered: Vec<(StreamId, Vec<u8>)>,
    pub events: Vec<StreamEvent>,
    /// The client deleted itself; the session must be closed.
    pub close_requested: bool,
}

impl SessionOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Agent replies to client control requests.
#[derive(Debug)]
enum Reply {
    StatusAgent(StatusCode),
    Status(StatusPayload),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// State for one connected XRCE client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: TransportAddr,
    endianness: Endianness,
    config: StreamConfig,
    max_frame_size: usize,
    best_effort_in: HashMap<StreamId, BestEffortInputStream>,
    best_effort_out: HashMap<StreamId, BestEffortOutputStream>,
    reliable_in: HashMap<StreamId, ReliableInputStream>,
    reliable_out: HashMap<StreamId, ReliableOutputStream>,
    stats: Arc<SessionStats>,
    last_activity: Instant,
}

impl Session {
    pub fn new(id: SessionId, peer: TransportAddr, config: StreamConfig, now: Instant) -> Self {
        let max_frame_size = config.max_frame_size;
        Self {
            id,
            peer,
            endianness: Endianness::Little,
            config,
            max_frame_size,
            best_effort_in: HashMap::new(),
            best_effort_out: HashMap::new(),
            reliable_in: HashMap::new(),
            reliable_out: HashMap::new(),
            stats: Arc::new(SessionStats::new()),
            last_activity: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &TransportAddr {
        &self.peer
    }

    /// Follow a client whose transport address changed.
    pub fn set_peer(&mut self, peer: TransportAddr) {
        if peer != self.peer {
            tracing::debug!(session = %self.id, old = %self.peer, new = %peer, "client address changed");
            self.peer = peer;
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// State of an agent input stream, if it was ever used.
    pub fn input_state(&self, stream: StreamId) -> Option<StreamState> {
        match stream.kind() {
            StreamKind::BestEffort => self.best_effort_in.get(&stream).map(|s| s.state()),
            StreamKind::Reliable => self.reliable_in.get(&stream).map(|s| s.state()),
            StreamKind::None => None,
        }
    }

    /// State of an agent output stream, if it was ever used.
    pub fn output_state(&self, stream: StreamId) -> Option<StreamState> {
        match stream.kind() {
            StreamKind::BestEffort => self.best_effort_out.get(&stream).map(|s| s.state()),
            StreamKind::Reliable => self.reliable_out.get(&stream).map(|s| s.state()),
            StreamKind::None => None,
        }
    }

    pub fn reliable_output(&self, stream: StreamId) -> Option<&ReliableOutputStream> {
        self.reliable_out.get(&stream)
    }

    pub fn reliable_input(&self, stream: StreamId) -> Option<&ReliableInputStream> {
        self.reliable_in.get(&stream)
    }

    fn frame_limits(&self) -> FrameLimits {
        let whole = self
            .max_frame_size
            .saturating_sub(MessageHeader::encoded_len(self.id.session_id));
        FrameLimits {
            whole,
            chunk: whole.saturating_sub(SUBMESSAGE_HEADER_SIZE),
        }
    }

    fn header(&self, stream: StreamId, seq: SeqNum) -> MessageHeader {
        let session_id = self.id.session_id;
        MessageHeader {
            session_id,
            stream_id: stream.0,
            sequence_nr: seq,
            client_key: MessageHeader::carries_client_key(session_id).then_some(self.id.client_key),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one inbound message whose header was already parsed.
    pub fn handle_inbound(
        &mut self,
        header: &MessageHeader,
        body: &[u8],
        now: Instant,
        out: &mut SessionOutput,
    ) {
        self.last_activity = now;
        self.stats.add_datagrams_received(1);

        let stream = StreamId(header.stream_id);
        let mut outbox = Outbox::new();
        let mut replies = Vec::new();

        let anonymous = header.session_id == SESSION_ID_NONE_WITH_CLIENT_KEY
            || header.session_id == SESSION_ID_NONE_WITHOUT_CLIENT_KEY;
        if !anonymous && header.session_id != self.id.session_id {
            outbox.violation(
                stream,
                format!(
                    "session id {:02x} does not match {:02x}",
                    header.session_id, self.id.session_id
                ),
            );
        } else {
            match stream.kind() {
                StreamKind::None => {
                    self.handle_control(body, now, &mut outbox, &mut replies, out)
                }
                StreamKind::BestEffort => match decode_frame_body(body) {
                    Ok(frame) => {
                        let config = &self.config;
                        self.best_effort_in
                            .entry(stream)
                            .or_insert_with(|| BestEffortInputStream::new(stream, config))
                            .on_frame(header.sequence_nr, frame, now, &mut outbox);
                    }
                    Err(e) => outbox.violation(stream, e.to_string()),
                },
                StreamKind::Reliable => match decode_frame_body(body) {
                    Ok(frame) => {
                        let config = &self.config;
                        self.reliable_in
                            .entry(stream)
                            .or_insert_with(|| ReliableInputStream::new(stream, config))
                            .on_frame(header.sequence_nr, frame, now, &mut outbox);
                    }
                    Err(e) => outbox.violation(stream, e.to_string()),
                },
            }
        }

        self.finish(outbox, &replies, out);
    }

    fn handle_control(
        &mut self,
        body: &[u8],
        now: Instant,
        outbox: &mut Outbox,
        replies: &mut Vec<Reply>,
        out: &mut SessionOutput,
    ) {
        let submessages = match parse_submessages(body) {
            Ok(s) => s,
            Err(e) => {
                outbox.violation(StreamId::NONE, e.to_string());
                return;
            }
        };

        for sub in submessages {
            match sub {
                Submessage::CreateClient {
                    payload,
                    endianness,
                } => {
                    replies.push(Reply::StatusAgent(self.accept_create_client(&payload, endianness)));
                }
                Submessage::DeleteClient(payload) => {
                    tracing::info!(session = %self.id, "client deleted itself");
                    replies.push(Reply::Status(StatusPayload {
                        request_id: payload.request_id,
                        object_id: CLIENT_OBJECT_ID,
                        status: StatusCode::Ok,
                        implementation_status: 0,
                    }));
                    out.close_requested = true;
                }
                Submessage::Heartbeat(hb) => {
                    self.stats.add_heartbeats_received(1);
                    let stream = StreamId(hb.stream_id);
                    if !stream.is_reliable() {
                        outbox.violation(stream, "heartbeat for a non-reliable stream");
                        continue;
                    }
                    let config = &self.config;
                    self.reliable_in
                        .entry(stream)
                        .or_insert_with(|| ReliableInputStream::new(stream, config))
                        .on_heartbeat(&hb, now, outbox);
                }
                Submessage::Acknack(ack) => {
                    self.stats.add_acknacks_received(1);
                    let stream = StreamId(ack.stream_id);
                    match self.reliable_out.get_mut(&stream) {
                        Some(s) => s.on_acknack(&ack, now, outbox),
                        None => outbox.violation(stream, "acknack for an unused stream"),
                    }
                }
                Submessage::Reset => {
                    tracing::info!(session = %self.id, "client requested reset");
                    self.reset();
                }
                Submessage::StatusAgent(_) => {
                    outbox.violation(StreamId::NONE, "STATUS_AGENT sent by a client");
                }
                Submessage::Fragment { .. } => {
                    outbox.violation(StreamId::NONE, "FRAGMENT on the unsequenced stream");
                }
                Submessage::Application { raw, .. } => {
                    outbox.delivered.push((StreamId::NONE, raw.to_vec()));
                }
            }
        }
    }

    fn accept_create_client(
        &mut self,
        payload: &CreateClientPayload,
        endianness: Endianness,
    ) -> StatusCode {
        if payload.client_key != self.id.client_key || payload.session_id != self.id.session_id {
            tracing::warn!(
                session = %self.id,
                key = %payload.client_key,
                session_id = payload.session_id,
                "CREATE_CLIENT for another session"
            );
            return StatusCode::ErrInvalidData;
        }
        self.endianness = endianness;
        if let Some(mtu) = payload.mtu {
            let mtu = usize::from(mtu);
            if mtu >= MIN_FRAME_SIZE {
                self.max_frame_size = self.config.max_frame_size.min(mtu);
            }
        }
        tracing::debug!(
            session = %self.id,
            ?endianness,
            frame = self.max_frame_size,
            "client created"
        );
        StatusCode::Ok
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send a complete logical message (encoded submessages) on `stream`.
    pub fn send(
        &mut self,
        stream: StreamId,
        message: &[u8],
        now: Instant,
        out: &mut SessionOutput,
    ) -> Result<SeqRange, XrceError> {
        if message.len() > self.config.max_message_size {
            return Err(XrceError::PayloadTooLarge {
                size: message.len(),
                limit: self.config.max_message_size,
            });
        }
        parse_submessages(message)?;

        let limits = self.frame_limits();
        let mut outbox = Outbox::new();
        let range = match stream.kind() {
            StreamKind::None => {
                // The unsequenced stream cannot carry fragments.
                if message.len() > limits.whole {
                    return Err(XrceError::InvalidStream(stream.0));
                }
                outbox.frames.push(OutboundFrame {
                    stream_id: stream,
                    seq: SeqNum::ZERO,
                    flags: FragmentFlags::Unfragmented,
                    payload: message.to_vec(),
                });
                SeqRange {
                    first: SeqNum::ZERO,
                    count: 1,
                }
            }
            StreamKind::BestEffort => self
                .best_effort_out
                .entry(stream)
                .or_insert_with(|| BestEffortOutputStream::new(stream))
                .enqueue(message, limits, &mut outbox)?,
            StreamKind::Reliable => {
                let config = &self.config;
                self.reliable_out
                    .entry(stream)
                    .or_insert_with(|| ReliableOutputStream::new(stream, config))
                    .enqueue(message, limits, now, &mut outbox)?
            }
        };
        self.stats.add_messages_sent(1);
        self.finish(outbox, &[], out);
        Ok(range)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Fire every expired stream timer.
    pub fn on_tick(&mut self, now: Instant, out: &mut SessionOutput) {
        let mut outbox = Outbox::new();
        for s in self.reliable_out.values_mut() {
            s.on_tick(now, &mut outbox);
        }
        for s in self.reliable_in.values_mut() {
            s.on_tick(now, &mut outbox);
        }
        for s in self.best_effort_in.values_mut() {
            s.on_tick(now, &mut outbox);
        }
        self.finish(outbox, &[], out);
    }

    /// Earliest stream timer, if any is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        let out = self.reliable_out.values().filter_map(|s| s.next_deadline());
        let inp = self.reliable_in.values().filter_map(|s| s.next_deadline());
        let be = self.best_effort_in.values().filter_map(|s| s.next_deadline());
        out.chain(inp).chain(be).min()
    }

    /// Emit acknowledgements still waiting for their period. Used when the
    /// session is about to close.
    pub fn flush(&mut self, out: &mut SessionOutput) {
        let mut outbox = Outbox::new();
        for s in self.reliable_in.values() {
            if s.ack_pending() {
                outbox.control.push(ControlRecord::Acknack(s.acknack()));
            }
        }
        self.finish(outbox, &[], out);
    }

    /// Reset every stream to its initial sequence state. Suspended streams
    /// become active again.
    pub fn reset(&mut self) {
        self.stats.add_resets(1);
        for s in self.reliable_out.values_mut() {
            s.reset();
        }
        for s in self.reliable_in.values_mut() {
            s.reset();
        }
        for s in self.best_effort_out.values_mut() {
            s.reset();
        }
        for s in self.best_effort_in.values_mut() {
            s.reset();
        }
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    fn finish(&self, outbox: Outbox, replies: &[Reply], out: &mut SessionOutput) {
        self.stats.add_retransmissions(u64::from(outbox.retransmissions));
        self.stats.add_duplicates(u64::from(outbox.duplicates));
        self.stats
            .add_discarded_messages(u64::from(outbox.discarded_messages));

        for frame in &outbox.frames {
            out.datagrams.push(self.encode_frame(frame));
        }

        let mut control: Vec<Vec<u8>> = Vec::new();
        let e = self.endianness;
        for reply in replies {
            match reply {
                Reply::StatusAgent(status) => {
                    self.push_control(&mut control, |buf| write_status_agent(buf, *status, e))
                }
                Reply::Status(status) => {
                    self.push_control(&mut control, |buf| write_status(buf, status, e))
                }
            }
        }
        for record in &outbox.control {
            match record {
                ControlRecord::Heartbeat(hb) => {
                    self.stats.add_heartbeats_sent(1);
                    self.push_control(&mut control, |buf| write_heartbeat(buf, hb, e));
                }
                ControlRecord::Acknack(ack) => {
                    self.stats.add_acknacks_sent(1);
                    self.push_control(&mut control, |buf| write_acknack(buf, ack, e));
                }
            }
        }
        out.datagrams.extend(control);

        for event in &outbox.events {
            if let StreamEvent::ProtocolViolation { .. } = event {
                self.stats.add_protocol_violations(1);
            }
        }
        self.stats.add_messages_delivered(outbox.delivered.len() as u64);
        out.delivered.extend(outbox.delivered);
        out.events.extend(outbox.events);
    }

    fn encode_frame(&self, frame: &OutboundFrame) -> Vec<u8> {
        let mut buf = begin_message(&self.header(frame.stream_id, frame.seq));
        match frame.flags {
            FragmentFlags::Unfragmented => buf.extend_from_slice(&frame.payload),
            flags => write_fragment(&mut buf, flags, self.endianness, &frame.payload),
        }
        buf
    }

    /// Append a control submessage, packing several per message while they
    /// fit in one frame.
    fn push_control(&self, batch: &mut Vec<Vec<u8>>, write: impl Fn(&mut Vec<u8>)) {
        if let Some(current) = batch.last_mut() {
            let before = current.len();
            write(current);
            if current.len() <= self.max_frame_size {
                return;
            }
            current.truncate(before);
        }
        let mut msg = begin_message(&self.header(StreamId::NONE, SeqNum::ZERO));
        write(&mut msg);
        batch.push(msg);
    }
}
