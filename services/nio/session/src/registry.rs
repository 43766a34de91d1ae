//! Reactor-side bookkeeping of managed sessions.
//!
//! Sessions report their own closure through [`ClosedSessions`]; the
//! reactor drains that queue in [`SessionRegistry::drain_closed`], which is
//! the only place a session is released and told it is disconnected.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::io_session::IoSession;
use crate::managed::ManagedSession;
use crate::tls::{TlsContext, TlsSessionInitializer, TlsSessionVerifier};
use crate::types::{EventMask, NamedEndpoint, SessionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Append-only handle to the reactor's closed-session queue
#[derive(Clone, Debug)]
pub struct ClosedSessions {
    tx: mpsc::UnboundedSender<Arc<ManagedSession>>,
}

impl ClosedSessions {
    /// Create a queue, returning the append handle and the reactor's receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Arc<ManagedSession>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn push(&self, session: Arc<ManagedSession>) {
        if self.tx.send(session).is_err() {
            debug!("closed-session queue is gone, reactor already stopped");
        }
    }
}

/// Live sessions of one reactor plus its closed-session queue
#[derive(Debug)]
pub struct SessionRegistry {
    /// Session defaults
    config: SessionConfig,
    /// Live sessions by ID
    sessions: DashMap<SessionId, Arc<ManagedSession>>,
    /// Handle given to every new session
    closed_tx: ClosedSessions,
    /// Queue drained by the reactor
    closed_rx: Mutex<mpsc::UnboundedReceiver<Arc<ManagedSession>>>,
}

impl SessionRegistry {
    /// Create a registry with the given defaults
    pub fn new(config: SessionConfig) -> Self {
        let (closed_tx, closed_rx) = ClosedSessions::channel();
        Self {
            config,
            sessions: DashMap::new(),
            closed_tx,
            closed_rx: Mutex::new(closed_rx),
        }
    }

    /// Session defaults
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle to the closed-session queue
    pub fn closed_sessions(&self) -> ClosedSessions {
        self.closed_tx.clone()
    }

    /// Wrap a freshly accepted or connected transport and track it
    pub fn register(
        &self,
        endpoint: Option<NamedEndpoint>,
        io_session: Arc<dyn IoSession>,
    ) -> Arc<ManagedSession> {
        if io_session.socket_timeout().is_none() && !self.config.socket_timeout.is_zero() {
            io_session.set_socket_timeout(Some(self.config.socket_timeout));
        }
        let session = ManagedSession::new(endpoint, io_session, self.closed_sessions());
        self.sessions.insert(session.id(), Arc::clone(&session));
        info!("Registered session {}", session);
        session
    }

    /// Layer TLS over `session` using the configured buffer strategy
    pub fn start_tls(
        &self,
        session: &ManagedSession,
        context: &dyn TlsContext,
        initializer: Option<Arc<dyn TlsSessionInitializer>>,
        verifier: Option<Arc<dyn TlsSessionVerifier>>,
    ) -> Result<(), SessionError> {
        session.start_tls(context, self.config.tls_buffer_strategy, initializer, verifier)
    }

    /// Look up a live session
    pub fn get(&self, id: SessionId) -> Option<Arc<ManagedSession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Dispatch readiness reported by the poller
    pub fn process_events(
        &self,
        session: &ManagedSession,
        ready: EventMask,
    ) -> Result<(), SessionError> {
        // No more events once a close was requested
        if session.is_terminated() {
            return Ok(());
        }
        session.update_access_time();
        if ready.contains(EventMask::READ) {
            session.on_input_ready()?;
        }
        if ready.contains(EventMask::WRITE) && !session.is_terminated() {
            session.on_output_ready()?;
        }
        Ok(())
    }

    /// Fire `on_timeout` for sessions idle longer than their socket timeout.
    ///
    /// Returns the number of sessions that timed out.
    pub fn check_timeouts(&self, now: SystemTime) -> usize {
        let expired: Vec<Arc<ManagedSession>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                match session.socket_timeout() {
                    Some(timeout) if !session.is_terminated() => now
                        .duration_since(session.last_access_time())
                        .map(|idle| idle > timeout)
                        .unwrap_or(false),
                    _ => false,
                }
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &expired {
            debug!("Session {} idle past its timeout", session);
            session.update_access_time();
            if let Err(e) = session.on_timeout() {
                warn!("Timeout dispatch failed for {}: {}", session, e);
            }
        }
        expired.len()
    }

    /// Release every session that reported closure and notify its handler.
    ///
    /// Returns the number of sessions released.
    pub fn drain_closed(&self) -> usize {
        let closed: Vec<Arc<ManagedSession>> = {
            let mut rx = self.closed_rx.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        for session in &closed {
            self.sessions.remove(&session.id());
            if let Err(e) = session.on_disconnected() {
                warn!("Disconnect dispatch failed for {}: {}", session, e);
            }
            debug!("Released session {}", session);
        }
        closed.len()
    }

    /// Immediately shut down every live session
    pub fn shutdown_all(&self) {
        let sessions: Vec<Arc<ManagedSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!("Shutting down {} sessions", sessions.len());
        for session in sessions {
            session.shutdown();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
