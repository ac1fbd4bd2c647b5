// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session registry and per-session workers.
//!
//! The registry maps a client key to the handle of the worker task that owns
//! that client's [`Session`]. It is the only cross-session structure: a
//! single `RwLock` serialises insert/remove while lookups share the read lock.
//! When both locks are needed, `sessions` is taken before `addresses`.
//!
//! ```text
//!   Agent::run ──try_send──> [mpsc] ──> worker ──> Session (sync state machine)
//!                                         │  ├─ sleep_until(next deadline)
//!   AgentHandle::send ──send──────────────┘  └─ ObjectRouter / XrceTransport
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, StreamConfig};
use crate::error::XrceError;
use crate::protocol::{ClientKey, MessageHeader};
use crate::router::{CloseReason, ObjectRouter};
use crate::session::{Session, SessionId, SessionOutput};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::stream::{SeqRange, StreamEvent, StreamId};
use crate::transport::{TransportAddr, XrceTransport};

/// Current time on the tokio clock, so paused-time tests drive every timer.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Decides whether a new session may be created.
///
/// Consulted before every creation, explicit or implicit, so identity
/// validation and rate limiting plug in here.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(
        &self,
        candidate: &SessionId,
        peer: &TransportAddr,
        active_sessions: usize,
    ) -> Result<(), XrceError>;
}

/// Caps the number of live sessions.
#[derive(Debug, Clone, Copy)]
pub struct MaxSessions(pub usize);

impl AdmissionPolicy for MaxSessions {
    fn admit(
        &self,
        candidate: &SessionId,
        _peer: &TransportAddr,
        active_sessions: usize,
    ) -> Result<(), XrceError> {
        if active_sessions >= self.0 {
            return Err(XrceError::SessionRejected(format!(
                "{}: session limit {} reached",
                candidate, self.0
            )));
        }
        Ok(())
    }
}

/// Admits everyone.
#[derive(Debug, Clone, Copy)]
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn admit(&self, _: &SessionId, _: &TransportAddr, _: usize) -> Result<(), XrceError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Result of a successful [`SessionHandle::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Sequence numbers assigned to the message.
    pub range: SeqRange,
    /// First transport failure while emitting the frames. Reliable frames
    /// stay queued and are retransmitted on the normal timeout path.
    pub transport_error: Option<XrceError>,
}

pub(crate) enum SessionCommand {
    Inbound {
        header: MessageHeader,
        body: Vec<u8>,
        from: TransportAddr,
    },
    Send {
        stream: StreamId,
        message: Vec<u8>,
        reply: oneshot::Sender<Result<SendReceipt, XrceError>>,
    },
    Reset,
}

#[derive(Debug)]
struct SessionShared {
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    /// Fired once the worker flushed and reported the close.
    finished: CancellationToken,
}

/// Cheap, cloneable reference to a running session worker.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    generation: u64,
    tx: mpsc::Sender<SessionCommand>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Distinguishes successive sessions of the same client.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// True once the worker stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shared.cancel.is_cancelled()
    }

    /// Queue an inbound message without waiting.
    pub(crate) fn push_inbound(
        &self,
        header: MessageHeader,
        body: Vec<u8>,
        from: TransportAddr,
    ) -> Result<(), XrceError> {
        self.tx
            .try_send(SessionCommand::Inbound { header, body, from })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => XrceError::WouldBlock,
                mpsc::error::TrySendError::Closed(_) => XrceError::Shutdown,
            })
    }

    /// Send a logical message on `stream`.
    pub async fn send(&self, stream: StreamId, message: Vec<u8>) -> Result<SendReceipt, XrceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Send {
                stream,
                message,
                reply,
            })
            .await
            .map_err(|_| XrceError::Shutdown)?;
        rx.await.map_err(|_| XrceError::Shutdown)?
    }

    /// Reset every stream of the session.
    pub async fn reset(&self) -> Result<(), XrceError> {
        self.tx
            .send(SessionCommand::Reset)
            .await
            .map_err(|_| XrceError::Shutdown)
    }

    /// Ask the worker to close. The first reason given wins.
    pub fn close(&self, reason: CloseReason) {
        self.shared.close_reason.lock().get_or_insert(reason);
        self.shared.cancel.cancel();
    }

    /// Wait until the worker has flushed and reported the close.
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Collaborators every session worker needs.
pub(crate) struct WorkerContext {
    pub config: Arc<AgentConfig>,
    pub stream_config: StreamConfig,
    pub transport: Arc<dyn XrceTransport>,
    pub router: Arc<dyn ObjectRouter>,
}

/// Maps client identities to running sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientKey, SessionHandle>>,
    /// Peers that use key-less headers are resolved by address. Records
    /// outlive idle sessions so such a client can be recreated implicitly.
    addresses: RwLock<HashMap<TransportAddr, ClientKey>>,
    next_generation: AtomicU64,
    admission: Box<dyn AdmissionPolicy>,
    ctx: WorkerContext,
}

impl SessionRegistry {
    pub(crate) fn new(ctx: WorkerContext, admission: Box<dyn AdmissionPolicy>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            addresses: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            admission,
            ctx,
        })
    }

    /// Live session for `key`.
    pub fn get(&self, key: &ClientKey) -> Option<SessionHandle> {
        self.sessions
            .read()
            .get(key)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Client key last announced from `addr`.
    pub fn lookup_address(&self, addr: &TransportAddr) -> Option<ClientKey> {
        self.addresses.read().get(addr).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    /// Existing session for the client, or a new one. Concurrent callers
    /// for the same key all get the same session.
    pub fn resolve_or_create(
        self: &Arc<Self>,
        id: SessionId,
        peer: &TransportAddr,
    ) -> Result<SessionHandle, XrceError> {
        if let Some(handle) = self.get(&id.client_key) {
            return Ok(handle);
        }
        let mut sessions = self.sessions.write();
        // Re-check: another caller may have won the race.
        if let Some(handle) = sessions.get(&id.client_key) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        self.insert_locked(&mut sessions, id, peer)
    }

    /// Start a fresh session for the client, replacing any existing one.
    pub fn create(
        self: &Arc<Self>,
        id: SessionId,
        peer: &TransportAddr,
    ) -> Result<SessionHandle, XrceError> {
        let mut sessions = self.sessions.write();
        self.insert_locked(&mut sessions, id, peer)
    }

    fn insert_locked(
        self: &Arc<Self>,
        sessions: &mut HashMap<ClientKey, SessionHandle>,
        id: SessionId,
        peer: &TransportAddr,
    ) -> Result<SessionHandle, XrceError> {
        let active = sessions
            .iter()
            .filter(|(key, h)| **key != id.client_key && !h.is_closed())
            .count();
        if let Err(e) = self.admission.admit(&id, peer, active) {
            tracing::warn!(session = %id, %peer, error = %e, "session refused");
            return Err(e);
        }

        let handle = self.spawn_worker(id, peer.clone());
        if let Some(old) = sessions.insert(id.client_key, handle.clone()) {
            tracing::info!(session = %old.id(), generation = old.generation(), "session replaced");
            old.close(CloseReason::Replaced);
        }
        let mut addresses = self.addresses.write();
        addresses.insert(peer.clone(), id.client_key);
        self.prune_addresses(sessions, &mut addresses);
        tracing::info!(session = %id, %peer, generation = handle.generation(), "session created");
        Ok(handle)
    }

    /// Remove and close the session of `key`.
    pub fn remove(&self, key: &ClientKey, reason: CloseReason) -> Option<SessionHandle> {
        let handle = self.sessions.write().remove(key)?;
        if reason.forgets_peer() {
            self.forget_addresses(key);
        }
        handle.close(reason);
        Some(handle)
    }

    /// The connection of `peer` is gone: drop its address record and close
    /// the session bound to it, unless the client is still reachable through
    /// another address.
    pub fn disconnect(&self, peer: &TransportAddr) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write();
        let mut addresses = self.addresses.write();
        let key = addresses.remove(peer)?;
        if addresses.values().any(|k| *k == key) {
            return None;
        }
        drop(addresses);
        let handle = sessions.remove(&key)?;
        drop(sessions);
        handle.close(CloseReason::Disconnected);
        Some(handle)
    }

    /// Remove the entry only if it still belongs to `generation`.
    fn remove_generation(&self, key: &ClientKey, generation: u64, reason: CloseReason) {
        let mut sessions = self.sessions.write();
        if sessions.get(key).is_some_and(|h| h.generation == generation) {
            sessions.remove(key);
            drop(sessions);
            if reason.forgets_peer() {
                self.forget_addresses(key);
            }
        }
    }

    fn forget_addresses(&self, key: &ClientKey) {
        self.addresses.write().retain(|_, k| k != key);
    }

    fn remember_address(&self, addr: &TransportAddr, key: ClientKey) {
        if self.addresses.read().get(addr) == Some(&key) {
            return;
        }
        let sessions = self.sessions.read();
        let mut addresses = self.addresses.write();
        addresses.insert(addr.clone(), key);
        self.prune_addresses(&sessions, &mut addresses);
    }

    /// Past the bound, keep only records of clients with a live session.
    fn prune_addresses(
        &self,
        sessions: &HashMap<ClientKey, SessionHandle>,
        addresses: &mut HashMap<TransportAddr, ClientKey>,
    ) {
        let bound = self.ctx.config.max_sessions.saturating_mul(2);
        if addresses.len() > bound {
            addresses.retain(|_, key| sessions.contains_key(key));
            tracing::debug!(kept = addresses.len(), "address records pruned");
        }
    }

    /// Close every session with `reason` and wait for the workers to finish
    /// flushing.
    pub async fn close_all(&self, reason: CloseReason) {
        let handles = self.handles();
        for h in &handles {
            h.close(reason);
        }
        for h in &handles {
            h.closed().await;
        }
    }

    fn spawn_worker(self: &Arc<Self>, id: SessionId, peer: TransportAddr) -> SessionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.ctx.config.session_queue_capacity);
        let session = Session::new(id, peer, self.ctx.stream_config.clone(), now());
        let shared = Arc::new(SessionShared {
            stats: Arc::clone(session.stats()),
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            finished: CancellationToken::new(),
        });
        let worker = Worker {
            session,
            generation,
            rx,
            shared: Arc::clone(&shared),
            registry: Arc::clone(self),
        };
        tokio::spawn(worker.run());
        SessionHandle {
            id,
            generation,
            tx,
            shared,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Sole owner of one [`Session`].
struct Worker {
    session: Session,
    generation: u64,
    rx: mpsc::Receiver<SessionCommand>,
    shared: Arc<SessionShared>,
    registry: Arc<SessionRegistry>,
}

impl Worker {
    async fn run(mut self) {
        let id = self.session.id();
        let idle_timeout = self.registry.ctx.config.session_idle_timeout();
        self.registry.ctx.router.session_created(id);

        let reason = loop {
            let idle_at = self.session.last_activity() + idle_timeout;
            let wake = self
                .session
                .next_deadline()
                .map_or(idle_at, |d| d.min(idle_at));

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    let reason = *self.shared.close_reason.lock();
                    break reason.unwrap_or(CloseReason::Shutdown);
                }
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        break CloseReason::Shutdown;
                    };
                    if let Some(reason) = self.handle_command(cmd) {
                        break reason;
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    let now = now();
                    if now >= self.session.last_activity() + idle_timeout {
                        break CloseReason::IdleTimeout;
                    }
                    let mut out = SessionOutput::new();
                    self.session.on_tick(now, &mut out);
                    self.dispatch(out);
                }
            }
        };

        self.registry
            .remove_generation(&id.client_key, self.generation, reason);
        self.rx.close();
        let mut out = SessionOutput::new();
        self.session.flush(&mut out);
        self.dispatch(out);
        tracing::info!(session = %id, %reason, "session closed");
        self.registry.ctx.router.session_closed(id, reason);
        self.shared.finished.cancel();
    }

    fn handle_command(&mut self, cmd: SessionCommand) -> Option<CloseReason> {
        match cmd {
            SessionCommand::Inbound { header, body, from } => {
                if header.client_key.is_some() {
                    self.registry
                        .remember_address(&from, self.session.id().client_key);
                }
                self.session.set_peer(from);
                let mut out = SessionOutput::new();
                self.session.handle_inbound(&header, &body, now(), &mut out);
                let close = out.close_requested;
                self.dispatch(out);
                close.then_some(CloseReason::ClientRequest)
            }
            SessionCommand::Send {
                stream,
                message,
                reply,
            } => {
                let mut out = SessionOutput::new();
                let result = self
                    .session
                    .send(stream, &message, now(), &mut out)
                    .map(|range| SendReceipt {
                        range,
                        transport_error: self.dispatch(out),
                    });
                let _ = reply.send(result);
                None
            }
            SessionCommand::Reset => {
                self.session.reset();
                None
            }
        }
    }

    /// Push output to the transport and the router. Returns the first
    /// transport error.
    fn dispatch(&self, out: SessionOutput) -> Option<XrceError> {
        let id = self.session.id();
        let ctx = &self.registry.ctx;
        let stats = self.session.stats();
        let mut first_error = None;

        for datagram in &out.datagrams {
            match ctx.transport.send(self.session.peer(), datagram) {
                Ok(()) => stats.add_datagrams_sent(1),
                Err(e) => {
                    stats.add_send_failures(1);
                    tracing::debug!(session = %id, error = %e, "send failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        for (stream, message) in out.delivered {
            ctx.router.deliver(id, stream, message);
        }
        for event in &out.events {
            match event {
                StreamEvent::ProtocolViolation { .. } => {}
                other => tracing::warn!(session = %id, event = ?other, "stream event"),
            }
            ctx.router.stream_event(id, event);
        }
        first_error
    }
}
