// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// DDS-XRCE v1.0 wire format parser/builder.
//
// All parsing is safe: malformed input returns Err, never panics.
// Only the submessages the session engine acts on are decoded; everything
// else (CREATE, WRITE_DATA, DATA...) is carried as opaque bytes for the
// object-model layer.

use std::fmt;

use crate::error::XrceError;
use crate::seq::SeqNum;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// XRCE message header size without client key.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Client key size, present in the header when `session_id < 0x80`.
pub const CLIENT_KEY_SIZE: usize = 4;

/// XRCE submessage header size in bytes.
pub const SUBMESSAGE_HEADER_SIZE: usize = 4;

/// Session ids at or above this value carry no client key in the header.
pub const SESSION_ID_WITHOUT_CLIENT_KEY: u8 = 0x80;

/// "No session" id for headers that carry a client key.
pub const SESSION_ID_NONE_WITH_CLIENT_KEY: u8 = 0x00;

/// "No session" id for headers without a client key.
pub const SESSION_ID_NONE_WITHOUT_CLIENT_KEY: u8 = 0x80;

// Submessage IDs
pub const SUBMSG_CREATE_CLIENT: u8 = 0x00;
pub const SUBMSG_CREATE: u8 = 0x01;
pub const SUBMSG_GET_INFO: u8 = 0x02;
pub const SUBMSG_DELETE: u8 = 0x03;
pub const SUBMSG_STATUS_AGENT: u8 = 0x04;
pub const SUBMSG_STATUS: u8 = 0x05;
pub const SUBMSG_INFO: u8 = 0x06;
pub const SUBMSG_WRITE_DATA: u8 = 0x07;
pub const SUBMSG_READ_DATA: u8 = 0x08;
pub const SUBMSG_DATA: u8 = 0x09;
pub const SUBMSG_ACKNACK: u8 = 0x0A;
pub const SUBMSG_HEARTBEAT: u8 = 0x0B;
pub const SUBMSG_RESET: u8 = 0x0C;
pub const SUBMSG_FRAGMENT: u8 = 0x0D;
pub const SUBMSG_TIMESTAMP: u8 = 0x0E;
pub const SUBMSG_TIMESTAMP_REPLY: u8 = 0x0F;

// Submessage flags
pub const FLAG_LITTLE_ENDIAN: u8 = 0x01;
pub const FLAG_LAST_FRAGMENT: u8 = 0x02;

pub const XRCE_COOKIE: [u8; 4] = *b"XRCE";
pub const XRCE_VERSION: [u8; 2] = [0x01, 0x00];
pub const AGENT_VENDOR_ID: [u8; 2] = [0x0F, 0x0D];

/// Object id of the client itself (DELETE on it closes the session).
pub const CLIENT_OBJECT_ID: u16 = 0xFFFE;

// Status codes
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_OK_MATCHED: u8 = 0x01;
pub const STATUS_ERR_DDS_ERROR: u8 = 0x80;
pub const STATUS_ERR_MISMATCH: u8 = 0x81;
pub const STATUS_ERR_ALREADY_EXISTS: u8 = 0x82;
pub const STATUS_ERR_DENIED: u8 = 0x83;
pub const STATUS_ERR_UNKNOWN_REFERENCE: u8 = 0x84;
pub const STATUS_ERR_INVALID_DATA: u8 = 0x85;
pub const STATUS_ERR_INCOMPATIBLE: u8 = 0x86;
pub const STATUS_ERR_RESOURCES: u8 = 0x87;

// ---------------------------------------------------------------------------
// Client key
// ---------------------------------------------------------------------------

/// Client-chosen 4-byte key identifying a client across transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientKey(pub [u8; 4]);

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = self.0;
        write!(f, "{:02x}{:02x}{:02x}{:02x}", k[0], k[1], k[2], k[3])
    }
}

// ---------------------------------------------------------------------------
// Endianness
// ---------------------------------------------------------------------------

/// Payload byte order, carried in bit 0 of every submessage's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn from_flags(flags: u8) -> Self {
        if flags & FLAG_LITTLE_ENDIAN != 0 {
            Self::Little
        } else {
            Self::Big
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            Self::Little => FLAG_LITTLE_ENDIAN,
            Self::Big => 0,
        }
    }

    fn read_u16(self, b: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(b),
            Self::Big => u16::from_be_bytes(b),
        }
    }

    fn u16_bytes(self, v: u16) -> [u8; 2] {
        match self {
            Self::Little => v.to_le_bytes(),
            Self::Big => v.to_be_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status code enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = STATUS_OK,
    OkMatched = STATUS_OK_MATCHED,
    ErrDds = STATUS_ERR_DDS_ERROR,
    ErrMismatch = STATUS_ERR_MISMATCH,
    ErrAlreadyExists = STATUS_ERR_ALREADY_EXISTS,
    ErrDenied = STATUS_ERR_DENIED,
    ErrUnknownReference = STATUS_ERR_UNKNOWN_REFERENCE,
    ErrInvalidData = STATUS_ERR_INVALID_DATA,
    ErrIncompatible = STATUS_ERR_INCOMPATIBLE,
    ErrResources = STATUS_ERR_RESOURCES,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Result<Self, XrceError> {
        match v {
            STATUS_OK => Ok(Self::Ok),
            STATUS_OK_MATCHED => Ok(Self::OkMatched),
            STATUS_ERR_DDS_ERROR => Ok(Self::ErrDds),
            STATUS_ERR_MISMATCH => Ok(Self::ErrMismatch),
            STATUS_ERR_ALREADY_EXISTS => Ok(Self::ErrAlreadyExists),
            STATUS_ERR_DENIED => Ok(Self::ErrDenied),
            STATUS_ERR_UNKNOWN_REFERENCE => Ok(Self::ErrUnknownReference),
            STATUS_ERR_INVALID_DATA => Ok(Self::ErrInvalidData),
            STATUS_ERR_INCOMPATIBLE => Ok(Self::ErrIncompatible),
            STATUS_ERR_RESOURCES => Ok(Self::ErrResources),
            _ => Err(XrceError::violation(format!("unknown status code 0x{:02x}", v))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Top-level XRCE message header (4 bytes, 8 with client key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u8,
    pub stream_id: u8,
    pub sequence_nr: SeqNum,
    /// Present iff `session_id < 0x80`.
    pub client_key: Option<ClientKey>,
}

impl MessageHeader {
    /// Whether headers for `session_id` carry the client key inline.
    pub fn carries_client_key(session_id: u8) -> bool {
        session_id < SESSION_ID_WITHOUT_CLIENT_KEY
    }

    /// Parse a header. Returns the header and the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), XrceError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        let session_id = buf[0];
        let stream_id = buf[1];
        let sequence_nr = SeqNum::new(u16::from_le_bytes([buf[2], buf[3]]));
        if !Self::carries_client_key(session_id) {
            return Ok((
                Self {
                    session_id,
                    stream_id,
                    sequence_nr,
                    client_key: None,
                },
                MESSAGE_HEADER_SIZE,
            ));
        }
        let end = MESSAGE_HEADER_SIZE + CLIENT_KEY_SIZE;
        if buf.len() < end {
            return Err(XrceError::BufferTooShort);
        }
        let mut key = [0u8; CLIENT_KEY_SIZE];
        key.copy_from_slice(&buf[MESSAGE_HEADER_SIZE..end]);
        Ok((
            Self {
                session_id,
                stream_id,
                sequence_nr,
                client_key: Some(ClientKey(key)),
            },
            end,
        ))
    }

    pub fn encoded_len(session_id: u8) -> usize {
        if Self::carries_client_key(session_id) {
            MESSAGE_HEADER_SIZE + CLIENT_KEY_SIZE
        } else {
            MESSAGE_HEADER_SIZE
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.session_id);
        buf.push(self.stream_id);
        buf.extend_from_slice(&self.sequence_nr.raw().to_le_bytes());
        if Self::carries_client_key(self.session_id) {
            buf.extend_from_slice(&self.client_key.unwrap_or_default().0);
        }
    }
}

// ---------------------------------------------------------------------------
// Submessage header
// ---------------------------------------------------------------------------

/// Submessage header (4 bytes). `length` is always little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub submessage_id: u8,
    pub flags: u8,
    pub length: u16,
}

impl SubmessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, XrceError> {
        if buf.len() < SUBMESSAGE_HEADER_SIZE {
            return Err(XrceError::BufferTooShort);
        }
        Ok(Self {
            submessage_id: buf[0],
            flags: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.submessage_id);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
    }

    pub fn endianness(&self) -> Endianness {
        Endianness::from_flags(self.flags)
    }
}

// ---------------------------------------------------------------------------
// Fragment flags
// ---------------------------------------------------------------------------

/// Position of a frame inside a (possibly) fragmented logical message.
///
/// DDS-XRCE only marks the last fragment; a fragment run starts with the
/// first FRAGMENT that follows a complete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentFlags {
    /// Whole message, not wrapped in a FRAGMENT submessage.
    Unfragmented,
    /// FRAGMENT with more to follow.
    More,
    /// FRAGMENT closing the message.
    Last,
}

impl FragmentFlags {
    /// Decode the flags of a FRAGMENT submessage.
    pub fn from_fragment_flags(flags: u8) -> Self {
        if flags & FLAG_LAST_FRAGMENT != 0 {
            Self::Last
        } else {
            Self::More
        }
    }

    /// Flag bits for a FRAGMENT submessage (endianness bit not included).
    pub fn to_fragment_flags(self) -> u8 {
        match self {
            Self::Last => FLAG_LAST_FRAGMENT,
            Self::Unfragmented | Self::More => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Control payloads
// ---------------------------------------------------------------------------

/// CREATE_CLIENT (0x00)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateClientPayload {
    pub vendor_id: [u8; 2],
    pub client_key: ClientKey,
    pub session_id: u8,
    /// Client MTU, when announced.
    pub mtu: Option<u16>,
}

/// STATUS_AGENT (0x04) - agent -> client reply to CREATE_CLIENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusAgentPayload {
    pub status: StatusCode,
    pub implementation_status: u8,
}

/// DELETE (0x03)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    pub request_id: u16,
    pub object_id: u16,
}

/// STATUS (0x05)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub request_id: u16,
    pub object_id: u16,
    pub status: StatusCode,
    pub implementation_status: u8,
}

/// HEARTBEAT (0x0B)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub first_unacked: SeqNum,
    pub last_unacked: SeqNum,
    pub stream_id: u8,
}

/// ACKNACK (0x0A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknackPayload {
    pub first_unacked: SeqNum,
    /// Bit N set means `first_unacked + N` is missing.
    pub nack_bitmap: u16,
    pub stream_id: u8,
}

impl AcknackPayload {
    /// Sequence numbers flagged as missing, in order.
    pub fn missing(&self) -> impl Iterator<Item = SeqNum> + '_ {
        (0..16u16)
            .filter(move |bit| self.nack_bitmap & (1 << bit) != 0)
            .map(move |bit| self.first_unacked.add(bit))
    }
}

// ---------------------------------------------------------------------------
// Unified submessage enum
// ---------------------------------------------------------------------------

/// One submessage of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage<'a> {
    /// CREATE_CLIENT with the byte order of its own submessage header.
    CreateClient {
        payload: CreateClientPayload,
        endianness: Endianness,
    },
    StatusAgent(StatusAgentPayload),
    /// DELETE targeting the client object.
    DeleteClient(DeletePayload),
    Heartbeat(HeartbeatPayload),
    Acknack(AcknackPayload),
    Reset,
    Fragment {
        flags: FragmentFlags,
        data: &'a [u8],
    },
    /// Object-model submessage, carried untouched (header included).
    Application {
        submessage_id: u8,
        raw: &'a [u8],
    },
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn u16_at(buf: &[u8], off: usize, e: Endianness) -> Result<u16, XrceError> {
    if off + 2 > buf.len() {
        return Err(XrceError::BufferTooShort);
    }
    Ok(e.read_u16([buf[off], buf[off + 1]]))
}

fn be_u16_at(buf: &[u8], off: usize) -> Result<u16, XrceError> {
    u16_at(buf, off, Endianness::Big)
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

fn require_len(payload: &[u8], min: usize) -> Result<(), XrceError> {
    if payload.len() < min {
        Err(XrceError::PayloadLengthMismatch)
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Submessage parsing
// ---------------------------------------------------------------------------

/// Parse a single submessage (header + payload) starting at `buf`.
/// Returns (submessage, bytes_consumed).
pub fn parse_submessage(buf: &[u8]) -> Result<(Submessage<'_>, usize), XrceError> {
    let hdr = SubmessageHeader::parse(buf)?;
    let payload_end = SUBMESSAGE_HEADER_SIZE + hdr.length as usize;
    if buf.len() < payload_end {
        return Err(XrceError::BufferTooShort);
    }
    let payload = &buf[SUBMESSAGE_HEADER_SIZE..payload_end];
    let e = hdr.endianness();

    let submsg = match hdr.submessage_id {
        SUBMSG_CREATE_CLIENT => {
            require_len(payload, 14)?;
            if payload[0..4] != XRCE_COOKIE {
                return Err(XrceError::violation("CREATE_CLIENT without XRCE cookie"));
            }
            if payload[4] != XRCE_VERSION[0] {
                return Err(XrceError::violation(format!(
                    "unsupported XRCE major version {}",
                    payload[4]
                )));
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&payload[8..12]);
            let mtu = if payload.len() >= 16 {
                Some(u16_at(payload, 14, e)?)
            } else {
                None
            };
            Submessage::CreateClient {
                payload: CreateClientPayload {
                    vendor_id: [payload[6], payload[7]],
                    client_key: ClientKey(key),
                    session_id: payload[12],
                    mtu,
                },
                endianness: e,
            }
        }
        SUBMSG_STATUS_AGENT => {
            require_len(payload, 2)?;
            Submessage::StatusAgent(StatusAgentPayload {
                status: StatusCode::from_u8(payload[0])?,
                implementation_status: payload[1],
            })
        }
        SUBMSG_DELETE => {
            require_len(payload, 4)?;
            let request_id = be_u16_at(payload, 0)?;
            let object_id = be_u16_at(payload, 2)?;
            if object_id == CLIENT_OBJECT_ID {
                Submessage::DeleteClient(DeletePayload {
                    request_id,
                    object_id,
                })
            } else {
                Submessage::Application {
                    submessage_id: hdr.submessage_id,
                    raw: &buf[..payload_end],
                }
            }
        }
        SUBMSG_HEARTBEAT => {
            require_len(payload, 5)?;
            Submessage::Heartbeat(HeartbeatPayload {
                first_unacked: SeqNum::new(u16_at(payload, 0, e)?),
                last_unacked: SeqNum::new(u16_at(payload, 2, e)?),
                stream_id: payload[4],
            })
        }
        SUBMSG_ACKNACK => {
            require_len(payload, 5)?;
            Submessage::Acknack(AcknackPayload {
                first_unacked: SeqNum::new(u16_at(payload, 0, e)?),
                nack_bitmap: be_u16_at(payload, 2)?,
                stream_id: payload[4],
            })
        }
        SUBMSG_RESET => Submessage::Reset,
        SUBMSG_FRAGMENT => Submessage::Fragment {
            flags: FragmentFlags::from_fragment_flags(hdr.flags),
            data: payload,
        },
        SUBMSG_CREATE | SUBMSG_GET_INFO | SUBMSG_STATUS | SUBMSG_INFO | SUBMSG_WRITE_DATA
        | SUBMSG_READ_DATA | SUBMSG_DATA | SUBMSG_TIMESTAMP | SUBMSG_TIMESTAMP_REPLY => {
            Submessage::Application {
                submessage_id: hdr.submessage_id,
                raw: &buf[..payload_end],
            }
        }
        other => return Err(XrceError::UnknownSubmessageId(other)),
    };
    Ok((submsg, payload_end))
}

/// Parse every submessage of a message body (the bytes after the header).
///
/// Submessages start on 4-byte boundaries; trailing padding is allowed.
pub fn parse_submessages(body: &[u8]) -> Result<Vec<Submessage<'_>>, XrceError> {
    let mut offset = 0;
    let mut out = Vec::new();
    while offset < body.len() {
        if body.len() - offset < SUBMESSAGE_HEADER_SIZE {
            // Padding only.
            if body[offset..].iter().all(|&b| b == 0) {
                break;
            }
            return Err(XrceError::BufferTooShort);
        }
        let (submsg, consumed) = parse_submessage(&body[offset..])?;
        out.push(submsg);
        offset = align4(offset + consumed);
    }
    if out.is_empty() {
        return Err(XrceError::BufferTooShort);
    }
    Ok(out)
}

/// Body of a sequenced stream frame, as seen by the stream engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBody<'a> {
    pub flags: FragmentFlags,
    pub data: &'a [u8],
}

/// Classify a stream frame body.
///
/// A body starting with FRAGMENT yields the fragment payload and flags; any
/// other body is an unfragmented logical message returned whole.
pub fn decode_frame_body(body: &[u8]) -> Result<FrameBody<'_>, XrceError> {
    let hdr = SubmessageHeader::parse(body)?;
    if hdr.submessage_id != SUBMSG_FRAGMENT {
        // Validate the whole body so garbage never reaches the upper layer.
        for sub in parse_submessages(body)? {
            if matches!(sub, Submessage::Fragment { .. }) {
                return Err(XrceError::violation("FRAGMENT must be the only submessage"));
            }
        }
        return Ok(FrameBody {
            flags: FragmentFlags::Unfragmented,
            data: body,
        });
    }
    let (sub, consumed) = parse_submessage(body)?;
    if body[align4(consumed).min(body.len())..].iter().any(|&b| b != 0) {
        return Err(XrceError::violation("FRAGMENT must be the only submessage"));
    }
    match sub {
        Submessage::Fragment { flags, data } => Ok(FrameBody { flags, data }),
        _ => Err(XrceError::violation("malformed FRAGMENT")),
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Append one submessage to a message buffer, padding to the 4-byte
/// boundary first. `buf` must start at the message header.
pub fn write_submessage(buf: &mut Vec<u8>, submessage_id: u8, flags: u8, payload: &[u8]) {
    let aligned = align4(buf.len());
    buf.resize(aligned, 0);
    SubmessageHeader {
        submessage_id,
        flags,
        length: payload.len() as u16,
    }
    .write_to(buf);
    buf.extend_from_slice(payload);
}

/// Append a FRAGMENT submessage.
pub fn write_fragment(buf: &mut Vec<u8>, flags: FragmentFlags, e: Endianness, data: &[u8]) {
    write_submessage(buf, SUBMSG_FRAGMENT, flags.to_fragment_flags() | e.flag(), data);
}

pub fn write_heartbeat(buf: &mut Vec<u8>, hb: &HeartbeatPayload, e: Endianness) {
    let mut pl = Vec::with_capacity(5);
    pl.extend_from_slice(&e.u16_bytes(hb.first_unacked.raw()));
    pl.extend_from_slice(&e.u16_bytes(hb.last_unacked.raw()));
    pl.push(hb.stream_id);
    write_submessage(buf, SUBMSG_HEARTBEAT, e.flag(), &pl);
}

pub fn write_acknack(buf: &mut Vec<u8>, ack: &AcknackPayload, e: Endianness) {
    let mut pl = Vec::with_capacity(5);
    pl.extend_from_slice(&e.u16_bytes(ack.first_unacked.raw()));
    pl.extend_from_slice(&ack.nack_bitmap.to_be_bytes());
    pl.push(ack.stream_id);
    write_submessage(buf, SUBMSG_ACKNACK, e.flag(), &pl);
}

pub fn write_status_agent(buf: &mut Vec<u8>, status: StatusCode, e: Endianness) {
    let mut pl = Vec::with_capacity(11);
    pl.push(status.as_u8());
    pl.push(0);
    pl.extend_from_slice(&XRCE_COOKIE);
    pl.extend_from_slice(&XRCE_VERSION);
    pl.extend_from_slice(&AGENT_VENDOR_ID);
    pl.push(0); // no optional properties
    write_submessage(buf, SUBMSG_STATUS_AGENT, e.flag(), &pl);
}

pub fn write_status(buf: &mut Vec<u8>, status: &StatusPayload, e: Endianness) {
    let mut pl = Vec::with_capacity(6);
    pl.extend_from_slice(&status.request_id.to_be_bytes());
    pl.extend_from_slice(&status.object_id.to_be_bytes());
    pl.push(status.status.as_u8());
    pl.push(status.implementation_status);
    write_submessage(buf, SUBMSG_STATUS, e.flag(), &pl);
}

pub fn write_create_client(buf: &mut Vec<u8>, payload: &CreateClientPayload, e: Endianness) {
    let mut pl = Vec::with_capacity(16);
    pl.extend_from_slice(&XRCE_COOKIE);
    pl.extend_from_slice(&XRCE_VERSION);
    pl.extend_from_slice(&payload.vendor_id);
    pl.extend_from_slice(&payload.client_key.0);
    pl.push(payload.session_id);
    pl.push(0); // no optional properties
    if let Some(mtu) = payload.mtu {
        pl.extend_from_slice(&e.u16_bytes(mtu));
    }
    write_submessage(buf, SUBMSG_CREATE_CLIENT, e.flag(), &pl);
}

pub fn write_delete(buf: &mut Vec<u8>, payload: &DeletePayload, e: Endianness) {
    let mut pl = Vec::with_capacity(4);
    pl.extend_from_slice(&payload.request_id.to_be_bytes());
    pl.extend_from_slice(&payload.object_id.to_be_bytes());
    write_submessage(buf, SUBMSG_DELETE, e.flag(), &pl);
}

pub fn write_reset(buf: &mut Vec<u8>, e: Endianness) {
    write_submessage(buf, SUBMSG_RESET, e.flag(), &[]);
}

/// Start a message buffer with the given header.
pub fn begin_message(header: &MessageHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    header.write_to(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(session_id: u8, stream_id: u8, seq: u16) -> MessageHeader {
        MessageHeader {
            session_id,
            stream_id,
            sequence_nr: SeqNum::new(seq),
            client_key: MessageHeader::carries_client_key(session_id)
                .then_some(ClientKey([0xDE, 0xAD, 0xBE, 0xEF])),
        }
    }

    #[test]
    fn test_message_header_with_and_without_key() {
        let with_key = header(0x01, 0x80, 0x1234);
        let mut buf = Vec::new();
        with_key.write_to(&mut buf);
        assert_eq!(buf, vec![0x01, 0x80, 0x34, 0x12, 0xDE, 0xAD, 0xBE, 0xEF]);
        let (parsed, used) = MessageHeader::parse(&buf).unwrap();
        assert_eq!(parsed, with_key);
        assert_eq!(used, 8);

        let without = header(0x81, 0x01, 7);
        let mut buf = Vec::new();
        without.write_to(&mut buf);
        assert_eq!(buf.len(), 4);
        let (parsed, used) = MessageHeader::parse(&buf).unwrap();
        assert_eq!(parsed.client_key, None);
        assert_eq!(used, 4);
    }

    #[test]
    fn test_header_missing_key_is_short() {
        assert_eq!(
            MessageHeader::parse(&[0x01, 0x00, 0x00, 0x00, 0xAA]),
            Err(XrceError::BufferTooShort)
        );
        assert_eq!(MessageHeader::parse(&[0x81]), Err(XrceError::BufferTooShort));
    }

    #[test]
    fn test_heartbeat_both_endiannesses() {
        for e in [Endianness::Little, Endianness::Big] {
            let hb = HeartbeatPayload {
                first_unacked: SeqNum::new(0x0102),
                last_unacked: SeqNum::new(0x0304),
                stream_id: 0x80,
            };
            let mut buf = Vec::new();
            write_heartbeat(&mut buf, &hb, e);
            let (parsed, consumed) = parse_submessage(&buf).unwrap();
            assert_eq!(parsed, Submessage::Heartbeat(hb));
            assert_eq!(consumed, 9);
        }
    }

    #[test]
    fn test_acknack_bitmap_is_big_endian() {
        let ack = AcknackPayload {
            first_unacked: SeqNum::new(5),
            nack_bitmap: 0b0000_0001_0000_0101,
            stream_id: 0x81,
        };
        let mut buf = Vec::new();
        write_acknack(&mut buf, &ack, Endianness::Little);
        assert_eq!(&buf[6..8], &[0x01, 0x05]);
        let (parsed, _) = parse_submessage(&buf).unwrap();
        assert_eq!(parsed, Submessage::Acknack(ack));
        let missing: Vec<u16> = ack.missing().map(SeqNum::raw).collect();
        assert_eq!(missing, vec![5, 7, 13]);
    }

    #[test]
    fn test_create_client_roundtrip() {
        let cc = CreateClientPayload {
            vendor_id: [0x01, 0x0F],
            client_key: ClientKey([1, 2, 3, 4]),
            session_id: 0x81,
            mtu: Some(512),
        };
        let mut buf = Vec::new();
        write_create_client(&mut buf, &cc, Endianness::Big);
        let (parsed, _) = parse_submessage(&buf).unwrap();
        assert_eq!(
            parsed,
            Submessage::CreateClient {
                payload: cc,
                endianness: Endianness::Big
            }
        );
    }

    #[test]
    fn test_create_client_bad_cookie() {
        let mut buf = Vec::new();
        write_submessage(&mut buf, SUBMSG_CREATE_CLIENT, FLAG_LITTLE_ENDIAN, &[0u8; 14]);
        assert!(matches!(
            parse_submessage(&buf),
            Err(XrceError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_delete_client_vs_application_delete() {
        let mut buf = Vec::new();
        write_delete(
            &mut buf,
            &DeletePayload {
                request_id: 1,
                object_id: CLIENT_OBJECT_ID,
            },
            Endianness::Little,
        );
        assert!(matches!(
            parse_submessage(&buf).unwrap().0,
            Submessage::DeleteClient(_)
        ));

        let mut buf = Vec::new();
        write_delete(
            &mut buf,
            &DeletePayload {
                request_id: 1,
                object_id: 0x0011,
            },
            Endianness::Little,
        );
        match parse_submessage(&buf).unwrap().0 {
            Submessage::Application { submessage_id, raw } => {
                assert_eq!(submessage_id, SUBMSG_DELETE);
                assert_eq!(raw, &buf[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_submessages_alignment() {
        let mut buf = Vec::new();
        write_submessage(&mut buf, SUBMSG_WRITE_DATA, FLAG_LITTLE_ENDIAN, &[1, 2, 3]);
        write_submessage(&mut buf, SUBMSG_WRITE_DATA, FLAG_LITTLE_ENDIAN, &[4, 5]);
        // 4 + 3 = 7 -> padded to 8 before the second submessage.
        assert_eq!(buf.len(), 8 + 4 + 2);
        assert_eq!(buf[7], 0);
        let subs = parse_submessages(&buf).unwrap();
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn test_unknown_submessage_id() {
        let mut buf = Vec::new();
        write_submessage(&mut buf, 0x42, 0, &[]);
        assert_eq!(
            parse_submessages(&buf),
            Err(XrceError::UnknownSubmessageId(0x42))
        );
    }

    #[test]
    fn test_truncated_payload() {
        let buf = [SUBMSG_HEARTBEAT, 0x01, 0x05, 0x00, 0x01];
        assert_eq!(parse_submessage(&buf), Err(XrceError::BufferTooShort));
        let buf = [SUBMSG_HEARTBEAT, 0x01, 0x01, 0x00, 0x01];
        assert_eq!(parse_submessage(&buf), Err(XrceError::PayloadLengthMismatch));
    }

    #[test]
    fn test_fragment_flags_mapping() {
        for f in [FragmentFlags::More, FragmentFlags::Last] {
            assert_eq!(FragmentFlags::from_fragment_flags(f.to_fragment_flags()), f);
        }
        // Only the endianness bit: more fragments follow.
        assert_eq!(
            FragmentFlags::from_fragment_flags(FLAG_LITTLE_ENDIAN),
            FragmentFlags::More
        );
        assert_eq!(
            FragmentFlags::from_fragment_flags(FLAG_LAST_FRAGMENT | FLAG_LITTLE_ENDIAN),
            FragmentFlags::Last
        );
    }

    #[test]
    fn test_decode_frame_body() {
        let mut app = Vec::new();
        write_submessage(&mut app, SUBMSG_WRITE_DATA, FLAG_LITTLE_ENDIAN, &[9, 9]);
        let body = decode_frame_body(&app).unwrap();
        assert_eq!(body.flags, FragmentFlags::Unfragmented);
        assert_eq!(body.data, &app[..]);

        let mut frag = Vec::new();
        write_fragment(&mut frag, FragmentFlags::More, Endianness::Little, &[1, 2, 3]);
        assert_eq!(frag[1], FLAG_LITTLE_ENDIAN);
        let body = decode_frame_body(&frag).unwrap();
        assert_eq!(body.flags, FragmentFlags::More);
        assert_eq!(body.data, &[1, 2, 3]);

        let mut bad = frag.clone();
        write_submessage(&mut bad, SUBMSG_WRITE_DATA, FLAG_LITTLE_ENDIAN, &[1]);
        assert!(decode_frame_body(&bad).is_err());
    }
}
