// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport abstraction.
//!
//! The engine only sees [`XrceTransport`]: a lazy sequence of
//! [`TransportEvent`]s and a non-blocking `send`. Every transport is treated
//! as lossy, even those that happen to be ordered and reliable.
//!
//! Connection-oriented transports also report [`TransportEvent::Disconnected`]
//! so the agent can close the session bound to that connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::XrceError;

/// Largest datagram read from a socket.
const MAX_DATAGRAM: usize = 65_536;

/// TCP frames are prefixed with their length as a little-endian u16.
const TCP_LENGTH_PREFIX: usize = 2;

/// Frames queued for one TCP connection before `send` reports WouldBlock.
const TCP_WRITE_QUEUE: usize = 64;

/// Events buffered between the TCP reader tasks and `recv`.
const TCP_EVENT_QUEUE: usize = 256;

const TCP_BACKLOG: i32 = 128;

// ---------------------------------------------------------------------------
// Transport address
// ---------------------------------------------------------------------------

/// Transport families, used to pick the frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Serial,
    /// In-process channel.
    Memory,
}

/// Address identifying a remote XRCE client over any transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    /// UDP socket address.
    Udp(SocketAddr),
    /// Remote end of a TCP connection.
    Tcp(SocketAddr),
    /// In-process peer id.
    Memory(u64),
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(sa) => write!(f, "udp://{}", sa),
            Self::Tcp(sa) => write!(f, "tcp://{}", sa),
            Self::Memory(id) => write!(f, "mem://{}", id),
        }
    }
}

/// What a transport hands to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete XRCE message.
    Datagram { data: Vec<u8>, from: TransportAddr },
    /// The connection to a client went away. Never emitted by datagram
    /// transports.
    Disconnected(TransportAddr),
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the physical transport used between the XRCE agent
/// and its clients.
#[async_trait]
pub trait XrceTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Wait for the next event. [`XrceError::Shutdown`] means the
    /// transport is gone for good.
    async fn recv(&self) -> Result<TransportEvent, XrceError>;

    /// Send without waiting. A full transport yields
    /// [`XrceError::WouldBlock`].
    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError>;
}

// ---------------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------------

/// UDP transport using `socket2` for setup and tokio for I/O.
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
}

impl UdpTransport {
    /// Bind a UDP socket to `addr` (IPv4 or IPv6). Must be called from
    /// within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, XrceError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket.into())?;
        tracing::info!(local = %addr, "UDP transport bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, XrceError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl XrceTransport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn recv(&self) -> Result<TransportEvent, XrceError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, peer) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(TransportEvent::Datagram {
            data: buf,
            from: TransportAddr::Udp(peer),
        })
    }

    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError> {
        match addr {
            TransportAddr::Udp(sa) => {
                self.socket.try_send_to(data, *sa)?;
                Ok(())
            }
            other => Err(XrceError::Transport(format!(
                "UDP transport cannot reach {}",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

type TcpWriters = Arc<parking_lot::Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// TCP transport. Each XRCE message travels as a 2-byte little-endian length
/// followed by the message bytes.
///
/// One reader and one writer task run per connection. A closed or broken
/// connection surfaces as [`TransportEvent::Disconnected`].
pub struct TcpTransport {
    local: SocketAddr,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    writers: TcpWriters,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Listen on `addr` (IPv4 or IPv6). Must be called from within a tokio
    /// runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, XrceError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(TCP_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(TCP_EVENT_QUEUE);
        let writers = TcpWriters::default();
        let cancel = CancellationToken::new();
        tokio::spawn(tcp_accept_loop(
            listener,
            tx,
            Arc::clone(&writers),
            cancel.clone(),
        ));
        tracing::info!(%local, "TCP transport listening");
        Ok(Self {
            local,
            events: Mutex::new(rx),
            writers,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Number of open client connections.
    pub fn connections(&self) -> usize {
        self.writers.lock().len()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl XrceTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn recv(&self) -> Result<TransportEvent, XrceError> {
        self.events.lock().await.recv().await.ok_or(XrceError::Shutdown)
    }

    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError> {
        let TransportAddr::Tcp(sa) = addr else {
            return Err(XrceError::Transport(format!(
                "TCP transport cannot reach {}",
                addr
            )));
        };
        let len = u16::try_from(data.len()).map_err(|_| XrceError::PayloadTooLarge {
            size: data.len(),
            limit: usize::from(u16::MAX),
        })?;
        let mut frame = Vec::with_capacity(TCP_LENGTH_PREFIX + data.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(data);

        let writers = self.writers.lock();
        let writer = writers
            .get(sa)
            .ok_or_else(|| XrceError::Transport(format!("{} not connected", addr)))?;
        writer.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => XrceError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => {
                XrceError::Transport(format!("{} closed", addr))
            }
        })
    }
}

async fn tcp_accept_loop(
    listener: tokio::net::TcpListener,
    events: mpsc::Sender<TransportEvent>,
    writers: TcpWriters,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept failed");
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "TCP_NODELAY not set");
        }
        tracing::debug!(%peer, "TCP client connected");
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(TCP_WRITE_QUEUE);
        writers.lock().insert(peer, tx);
        tokio::spawn(tcp_write_loop(writer, rx, cancel.child_token()));
        tokio::spawn(tcp_read_loop(
            reader,
            peer,
            events.clone(),
            Arc::clone(&writers),
            cancel.child_token(),
        ));
    }
}

async fn tcp_read_loop(
    mut reader: OwnedReadHalf,
    peer: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
    writers: TcpWriters,
    cancel: CancellationToken,
) {
    let from = TransportAddr::Tcp(peer);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read_tcp_frame(&mut reader) => frame,
        };
        match frame {
            Ok(data) => {
                let event = TransportEvent::Datagram {
                    data,
                    from: from.clone(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "TCP client disconnected");
                break;
            }
        }
    }
    // Dropping the sender stops the writer task.
    writers.lock().remove(&peer);
    let _ = events.send(TransportEvent::Disconnected(from)).await;
}

async fn read_tcp_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; TCP_LENGTH_PREFIX];
    reader.read_exact(&mut len).await?;
    let mut data = vec![0u8; usize::from(u16::from_le_bytes(len))];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

async fn tcp_write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(error = %e, "TCP write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

type Outgoing = (Vec<u8>, TransportAddr);

/// Channel-backed transport. The matching [`ChannelPeer`] plays the client
/// side: it injects datagrams and observes what the agent sends.
pub struct ChannelTransport {
    inbound: Mutex<mpsc::Receiver<TransportEvent>>,
    outbound: mpsc::Sender<Outgoing>,
}

/// Client end of a [`ChannelTransport`].
pub struct ChannelPeer {
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Receiver<Outgoing>,
}

impl ChannelTransport {
    /// Create a transport and its peer, each direction holding up to
    /// `capacity` datagrams.
    pub fn pair(capacity: usize) -> (ChannelTransport, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            ChannelTransport {
                inbound: Mutex::new(in_rx),
                outbound: out_tx,
            },
            ChannelPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl XrceTransport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn recv(&self) -> Result<TransportEvent, XrceError> {
        self.inbound.lock().await.recv().await.ok_or(XrceError::Shutdown)
    }

    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError> {
        self.outbound
            .try_send((data.to_vec(), addr.clone()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => XrceError::WouldBlock,
                mpsc::error::TrySendError::Closed(_) => {
                    XrceError::Transport("peer closed".into())
                }
            })
    }
}

impl ChannelPeer {
    /// Deliver a datagram to the agent as if sent from `from`.
    pub async fn inject(&self, from: TransportAddr, data: Vec<u8>) -> Result<(), XrceError> {
        self.inbound
            .send(TransportEvent::Datagram { data, from })
            .await
            .map_err(|_| XrceError::Shutdown)
    }

    /// Report the connection of `addr` as lost.
    pub async fn disconnect(&self, addr: TransportAddr) -> Result<(), XrceError> {
        self.inbound
            .send(TransportEvent::Disconnected(addr))
            .await
            .map_err(|_| XrceError::Shutdown)
    }

    /// Next datagram sent by the agent, waiting if none is queued.
    pub async fn next_sent(&mut self) -> Option<(Vec<u8>, TransportAddr)> {
        self.outbound.recv().await
    }

    /// Next datagram sent by the agent, if one is already queued.
    pub fn try_next_sent(&mut self) -> Option<(Vec<u8>, TransportAddr)> {
        self.outbound.try_recv().ok()
    }
}
