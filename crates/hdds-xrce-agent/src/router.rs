// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// ObjectRouter trait - the layer above the session engine.
//
// The engine never interprets object-model submessages: complete logical
// messages go up through `deliver` and come back down through
// `AgentHandle::send`.

use std::fmt;

use crate::session::SessionId;
use crate::stream::{StreamEvent, StreamId};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// DELETE of the client object.
    ClientRequest,
    /// No traffic for the idle timeout.
    IdleTimeout,
    /// A new CREATE_CLIENT for the same identity.
    Replaced,
    /// Agent cancellation.
    Shutdown,
    /// Removed through [`crate::AgentHandle::evict`].
    Evicted,
    /// The transport lost the client's connection.
    Disconnected,
}

impl CloseReason {
    /// True when the client is gone, not just its session. Address records
    /// of key-less clients are dropped only then.
    pub(crate) fn forgets_peer(self) -> bool {
        matches!(self, Self::ClientRequest | Self::Disconnected)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClientRequest => "client request",
            Self::IdleTimeout => "idle timeout",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
            Self::Evicted => "evicted",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Consumer of complete logical messages and session lifecycle events.
///
/// Called from session worker tasks; implementations must not block for
/// long. Calls for one session are sequential, calls for different sessions
/// may run concurrently.
pub trait ObjectRouter: Send + Sync {
    /// A session was created; initialise its entity namespace.
    fn session_created(&self, session: SessionId);

    /// A complete, ordered logical message arrived on `stream`.
    fn deliver(&self, session: SessionId, stream: StreamId, message: Vec<u8>);

    /// A session ended and all its state was released.
    fn session_closed(&self, session: SessionId, reason: CloseReason);

    /// A non-fatal stream condition (violation, suspension, timeout).
    fn stream_event(&self, session: SessionId, event: &StreamEvent) {
        let _ = (session, event);
    }
}

// ---------------------------------------------------------------------------
// Null router (for testing)
// ---------------------------------------------------------------------------

/// A router that discards everything. Useful for protocol-level testing
/// without an object model.
pub struct NullRouter;

impl ObjectRouter for NullRouter {
    fn session_created(&self, _session: SessionId) {}

    fn deliver(&self, _session: SessionId, _stream: StreamId, _message: Vec<u8>) {}

    fn session_closed(&self, _session: SessionId, _reason: CloseReason) {}
}
