// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DDS-XRCE v1.0 agent: session and reliable-stream engine.
//!
//! Turns a lossy, MTU-limited byte transport into ordered, loss-free,
//! reassembled message channels, multiplexed per client session and per
//! logical stream. The object model above (participants, topics, readers,
//! writers) plugs in through [`ObjectRouter`].
//!
//! # Architecture
//!
//! ```text
//! XRCE Client (MCU)              Agent (this crate)                    Object model
//!        |                            |                                     |
//!        |--- CREATE_CLIENT -------->|  SessionRegistry ─ spawn worker      |
//!        |<-- STATUS_AGENT ----------|                                     |
//!        |--- frames (seq, frag) --->|  Session ─ ReliableInputStream ─────>| deliver()
//!        |<-- ACKNACK / HEARTBEAT ---|                                     |
//!        |<-- frames ----------------|  ReliableOutputStream <─────────────| AgentHandle::send()
//!        |--- DELETE --------------->|  session closed ───────────────────>| session_closed()
//! ```
//!
//! # Key Features
//!
//! - **Sliding-window ARQ**: 16-bit wraparound sequence numbers, cumulative
//!   ACKNACK with a missing bitmap, heartbeats and timed retransmission
//! - **Fragmentation**: messages larger than a frame are split and reassembled
//! - **Session isolation**: one tokio task per client; no session ever waits
//!   on another
//! - **Transport-agnostic**: any [`XrceTransport`] works, every transport is
//!   treated as lossy
//!
//! # Transports
//!
//! | Transport | Use Case | Frame budget |
//! |-----------|----------|--------------|
//! | [`UdpTransport`] | WiFi / Ethernet MCUs | `frame_size.udp` |
//! | [`TcpTransport`] | Clients behind NAT or firewalls, 2-byte length framing | `frame_size.tcp` |
//! | [`ChannelTransport`] | In-process clients, tests | `frame_size.udp` |

pub mod agent;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod seq;
pub mod session;
pub mod stats;
pub mod stream;
pub mod transport;

// Re-exports for convenience.
pub use agent::{Agent, AgentHandle};
pub use config::{AgentConfig, ConfigError, FrameSizeConfig, StreamConfig};
pub use error::XrceError;
pub use protocol::{ClientKey, Endianness, MessageHeader, StatusCode, Submessage};
pub use registry::{AdmissionPolicy, AllowAll, MaxSessions, SendReceipt, SessionHandle, SessionRegistry};
pub use router::{CloseReason, NullRouter, ObjectRouter};
pub use seq::SeqNum;
pub use session::{Session, SessionId, SessionOutput};
pub use stats::{SessionStats, StatsSnapshot};
pub use stream::{SeqRange, StreamEvent, StreamId, StreamKind, StreamState};
pub use transport::{
    ChannelPeer, ChannelTransport, TcpTransport, TransportAddr, TransportEvent, TransportKind,
    UdpTransport, XrceTransport,
};
