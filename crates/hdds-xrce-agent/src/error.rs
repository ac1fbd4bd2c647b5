// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the XRCE agent.
//!
//! Nothing in this crate terminates the process on bad input: parse and
//! protocol errors are scoped to the datagram, stream or session that caused
//! them and surface through these variants or through [`StreamEvent`]s.
//!
//! [`StreamEvent`]: crate::stream::StreamEvent

use thiserror::Error;

use crate::config::ConfigError;
use crate::stream::StreamId;

/// Errors produced by the XRCE agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XrceError {
    /// Not enough bytes to parse a header or payload.
    #[error("buffer too short")]
    BufferTooShort,

    /// Unknown submessage id.
    #[error("unknown submessage id: 0x{0:02x}")]
    UnknownSubmessageId(u8),

    /// Declared payload length does not match the payload layout.
    #[error("payload length mismatch")]
    PayloadLengthMismatch,

    /// Frame rejected by protocol rules (out-of-window sequence number,
    /// malformed control payload, oversized message...).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Bounded buffer is full; retry after the peer acknowledges.
    #[error("would block: send window and backlog are full")]
    WouldBlock,

    /// Payload exceeds what the stream can carry.
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Stream exhausted its retry budget or timed out reassembling.
    #[error("stream {0} is suspended")]
    StreamSuspended(StreamId),

    /// Stream id cannot be used for the requested operation, such as a
    /// message on stream 0 that needs fragmentation.
    #[error("invalid stream id {0}")]
    InvalidStream(u8),

    /// No live session for the given identity.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Admission policy refused to create a session.
    #[error("session rejected: {0}")]
    SessionRejected(String),

    /// A transport-level I/O error (message only, not the original error).
    #[error("I/O error: {0}")]
    Io(String),

    /// Transport cannot reach the given address.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration validation error.
    #[error("config error: {0}")]
    Config(String),

    /// The agent or session worker is shutting down.
    #[error("agent is shutting down")]
    Shutdown,
}

impl From<std::io::Error> for XrceError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            Self::WouldBlock
        } else {
            Self::Io(e.to_string())
        }
    }
}

impl From<ConfigError> for XrceError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl XrceError {
    /// Shorthand for building a [`XrceError::ProtocolViolation`].
    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }
}
