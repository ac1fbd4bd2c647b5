// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// XRCE agent dispatcher.
//
// Pulls datagrams from the transport, resolves the owning session and hands
// the message to its worker. The dispatcher never waits on a session: a full
// worker queue drops the datagram, which the reliable streams recover from.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::XrceError;
use crate::protocol::{
    begin_message, parse_submessage, write_status_agent, ClientKey, CreateClientPayload,
    Endianness, MessageHeader, StatusCode, Submessage, SESSION_ID_NONE_WITHOUT_CLIENT_KEY,
    SESSION_ID_NONE_WITH_CLIENT_KEY,
};
use crate::registry::{
    AdmissionPolicy, MaxSessions, SendReceipt, SessionHandle, SessionRegistry, WorkerContext,
};
use crate::router::{CloseReason, ObjectRouter};
use crate::seq::SeqNum;
use crate::session::SessionId;
use crate::stats::StatsSnapshot;
use crate::stream::StreamId;
use crate::transport::{TransportAddr, TransportEvent, XrceTransport};

/// The XRCE agent: one transport, many client sessions.
pub struct Agent {
    config: Arc<AgentConfig>,
    transport: Arc<dyn XrceTransport>,
    registry: Arc<SessionRegistry>,
}

impl Agent {
    /// Create an agent that admits up to `config.max_sessions` clients.
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn XrceTransport>,
        router: Arc<dyn ObjectRouter>,
    ) -> Result<Self, XrceError> {
        let admission = Box::new(MaxSessions(config.max_sessions));
        Self::with_admission(config, transport, router, admission)
    }

    /// Create an agent with a custom admission policy.
    pub fn with_admission(
        config: AgentConfig,
        transport: Arc<dyn XrceTransport>,
        router: Arc<dyn ObjectRouter>,
        admission: Box<dyn AdmissionPolicy>,
    ) -> Result<Self, XrceError> {
        config.validate()?;
        let config = Arc::new(config);
        let ctx = WorkerContext {
            config: Arc::clone(&config),
            stream_config: config.stream_config(transport.kind()),
            transport: Arc::clone(&transport),
            router,
        };
        Ok(Self {
            config,
            transport,
            registry: SessionRegistry::new(ctx, admission),
        })
    }

    /// Handle for the object-model layer.
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Receive and dispatch until `cancel` fires or the transport shuts
    /// down, then close every session.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), XrceError> {
        tracing::info!(
            transport = ?self.transport.kind(),
            window = self.config.window_size,
            "XRCE agent running"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                received = self.transport.recv() => match received {
                    Ok(TransportEvent::Datagram { data, from }) => self.dispatch(&data, from),
                    Ok(TransportEvent::Disconnected(peer)) => self.disconnected(&peer),
                    Err(XrceError::Shutdown) => {
                        tracing::info!("transport closed");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "transport receive failed"),
                },
            }
        }
        self.registry.close_all(CloseReason::Shutdown).await;
        tracing::info!("XRCE agent stopped");
        Ok(())
    }

    /// Route one raw datagram to its session.
    pub fn dispatch(&self, data: &[u8], from: TransportAddr) {
        let limit = self.config.max_frame_size(self.transport.kind());
        if data.len() > limit {
            tracing::debug!(%from, len = data.len(), limit, "oversized datagram dropped");
            return;
        }
        let (header, used) = match MessageHeader::parse(data) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(%from, error = %e, "malformed header dropped");
                return;
            }
        };
        let body = &data[used..];

        if header.stream_id == StreamId::NONE.0 {
            if let Ok((
                Submessage::CreateClient {
                    payload,
                    endianness,
                },
                _,
            )) = parse_submessage(body)
            {
                self.create_client(header, body, &payload, endianness, from);
                return;
            }
        }

        let Some(key) = header.client_key.or_else(|| self.registry.lookup_address(&from)) else {
            tracing::debug!(%from, session_id = header.session_id, "datagram from unknown client");
            return;
        };
        let Some(handle) = self.resolve(key, &header, &from) else {
            return;
        };
        match handle.push_inbound(header, body.to_vec(), from.clone()) {
            Ok(()) => {}
            Err(XrceError::WouldBlock) => {
                tracing::warn!(session = %handle.id(), "session queue full, datagram dropped");
            }
            Err(_) => {
                // The session closed between lookup and push; the frame
                // starts a fresh one.
                if let Some(handle) = self.resolve(key, &header, &from) {
                    if let Err(e) = handle.push_inbound(header, body.to_vec(), from) {
                        tracing::debug!(session = %handle.id(), error = %e, "datagram dropped");
                    }
                }
            }
        }
    }

    /// Close the session bound to a lost connection.
    pub fn disconnected(&self, peer: &TransportAddr) {
        match self.registry.disconnect(peer) {
            Some(handle) => {
                tracing::info!(session = %handle.id(), %peer, "client connection lost");
            }
            None => tracing::debug!(%peer, "connection closed without a session"),
        }
    }

    fn resolve(
        &self,
        key: ClientKey,
        header: &MessageHeader,
        from: &TransportAddr,
    ) -> Option<SessionHandle> {
        if let Some(handle) = self.registry.get(&key) {
            return Some(handle);
        }
        let anonymous = header.session_id == SESSION_ID_NONE_WITH_CLIENT_KEY
            || header.session_id == SESSION_ID_NONE_WITHOUT_CLIENT_KEY;
        if !self.config.implicit_session_creation || anonymous {
            tracing::debug!(key = %key, %from, "no session for datagram");
            return None;
        }
        self.registry
            .resolve_or_create(SessionId::new(key, header.session_id), from)
            .ok()
    }

    fn create_client(
        &self,
        header: MessageHeader,
        body: &[u8],
        payload: &CreateClientPayload,
        endianness: Endianness,
        from: TransportAddr,
    ) {
        let id = SessionId::new(payload.client_key, payload.session_id);
        match self.registry.create(id, &from) {
            Ok(handle) => {
                if let Err(e) = handle.push_inbound(header, body.to_vec(), from) {
                    tracing::warn!(session = %id, error = %e, "CREATE_CLIENT not delivered");
                }
            }
            Err(_) => {
                let mut reply = begin_message(&MessageHeader {
                    session_id: id.session_id,
                    stream_id: StreamId::NONE.0,
                    sequence_nr: SeqNum::ZERO,
                    client_key: MessageHeader::carries_client_key(id.session_id)
                        .then_some(id.client_key),
                });
                write_status_agent(&mut reply, StatusCode::ErrResources, endianness);
                if let Err(e) = self.transport.send(&from, &reply) {
                    tracing::debug!(%from, error = %e, "rejection not sent");
                }
            }
        }
    }
}

/// Cloneable entry point for the object-model layer.
#[derive(Clone)]
pub struct AgentHandle {
    registry: Arc<SessionRegistry>,
}

impl AgentHandle {
    fn session(&self, id: SessionId) -> Result<SessionHandle, XrceError> {
        self.registry
            .get(&id.client_key)
            .filter(|h| h.id() == id)
            .ok_or_else(|| XrceError::SessionNotFound(id.to_string()))
    }

    /// Send a complete logical message to a client.
    pub async fn send(
        &self,
        session: SessionId,
        stream: StreamId,
        message: Vec<u8>,
    ) -> Result<SendReceipt, XrceError> {
        self.session(session)?.send(stream, message).await
    }

    /// Reset every stream of a session.
    pub async fn reset(&self, session: SessionId) -> Result<(), XrceError> {
        self.session(session)?.reset().await
    }

    /// Close a session. Returns false when it did not exist.
    pub fn evict(&self, session: SessionId) -> bool {
        if self.session(session).is_err() {
            return false;
        }
        self.registry
            .remove(&session.client_key, CloseReason::Evicted)
            .is_some()
    }

    /// Identities of all live sessions.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.registry
            .handles()
            .iter()
            .filter(|h| !h.is_closed())
            .map(|h| h.id())
            .collect()
    }

    pub fn stats(&self, session: SessionId) -> Option<StatsSnapshot> {
        self.session(session).ok().map(|h| h.stats())
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("sessions", &self.registry.len())
            .finish()
    }
}
