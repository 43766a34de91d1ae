//! Managed transport session.
//!
//! A [`ManagedSession`] wraps the raw transport created by the reactor,
//! optionally layers a TLS transport over it, and routes readiness events to
//! the protocol handler. All effective I/O goes through the TLS layer once
//! it is installed; transport identity (addresses, socket timeout, handler)
//! always comes from the raw transport.

use crate::error::SessionError;
use crate::io_session::{ByteChannel, IoEventHandler, IoSession};
use crate::registry::ClosedSessions;
use crate::tls::{
    TlsBufferStrategy, TlsContext, TlsDetails, TlsLayer, TlsLayerParams, TlsRole,
    TlsSessionInitializer, TlsSessionVerifier,
};
use crate::types::{Command, CommandPriority, EventMask, NamedEndpoint, SessionId, SessionStatus};
use once_cell::sync::OnceCell;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug)]
enum CloseMode {
    Graceful,
    Immediate,
}

/// Session wrapper owned by the reactor.
pub struct ManagedSession {
    /// Present for client-initiated sessions only
    endpoint: Option<NamedEndpoint>,
    /// Raw transport
    io_session: Arc<dyn IoSession>,
    /// TLS layer, installed at most once
    tls_session: OnceCell<Arc<dyn TlsLayer>>,
    /// Reactor queue notified when the session is closed
    closed_sessions: ClosedSessions,
    /// Set once by the first close or shutdown
    closed: AtomicBool,
    /// Wall-clock milliseconds of the last reactor-visible event
    last_access: AtomicU64,
    /// Handle to self for enqueueing into `closed_sessions`
    this: Weak<ManagedSession>,
}

impl ManagedSession {
    /// Wrap `io_session`. A `None` endpoint marks an accepted (server) session.
    pub fn new(
        endpoint: Option<NamedEndpoint>,
        io_session: Arc<dyn IoSession>,
        closed_sessions: ClosedSessions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            endpoint,
            io_session,
            tls_session: OnceCell::new(),
            closed_sessions,
            closed: AtomicBool::new(false),
            last_access: AtomicU64::new(now_millis()),
            this: this.clone(),
        })
    }

    /// Endpoint of a client-initiated session
    pub fn endpoint(&self) -> Option<&NamedEndpoint> {
        self.endpoint.as_ref()
    }

    /// Record reactor activity
    pub fn update_access_time(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    /// Time of the last reactor-visible event
    pub fn last_access_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_access.load(Ordering::Relaxed))
    }

    /// Whether close or shutdown has been requested
    pub fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a TLS layer is installed
    pub fn is_tls_active(&self) -> bool {
        self.tls_session.get().is_some()
    }

    fn effective(&self) -> &dyn IoSession {
        match self.tls_session.get() {
            Some(tls) => tls.as_io_session(),
            None => self.io_session.as_ref(),
        }
    }

    fn transport(&self) -> &dyn IoSession {
        self.io_session.as_ref()
    }

    fn event_handler(&self) -> Result<Arc<dyn IoEventHandler>, SessionError> {
        self.transport().handler().ok_or(SessionError::MissingHandler)
    }

    /// Install the TLS layer. The handshake starts on the next dispatched event.
    pub fn start_tls(
        &self,
        context: &dyn TlsContext,
        buffer_strategy: TlsBufferStrategy,
        initializer: Option<Arc<dyn TlsSessionInitializer>>,
        verifier: Option<Arc<dyn TlsSessionVerifier>>,
    ) -> Result<(), SessionError> {
        if self.tls_session.get().is_some() {
            return Err(SessionError::TlsAlreadyActive);
        }
        let role = if self.endpoint.is_some() {
            TlsRole::Client
        } else {
            TlsRole::Server
        };
        let layer = context.create_layer(TlsLayerParams {
            endpoint: self.endpoint.clone(),
            role,
            transport: Arc::clone(&self.io_session),
            buffer_strategy,
            initializer,
            verifier,
        })?;
        self.tls_session
            .set(layer)
            .map_err(|_| SessionError::TlsAlreadyActive)?;
        debug!("TLS layer installed on {} as {:?}", self, role);
        Ok(())
    }

    /// Negotiated TLS parameters, if TLS is active and established
    pub fn tls_session_details(&self) -> Option<TlsDetails> {
        self.tls_session.get().and_then(|tls| tls.tls_details())
    }

    /// Request a graceful close. Only the first close or shutdown has effect.
    pub fn close(&self) {
        self.terminate(CloseMode::Graceful);
    }

    /// Request an immediate close. Only the first close or shutdown has effect.
    pub fn shutdown(&self) {
        self.terminate(CloseMode::Immediate);
    }

    fn terminate(&self, mode: CloseMode) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // The reactor must learn about the close even if the transport panics
        let _notify = NotifyClosed(self);
        debug!("{:?} close of {}", mode, self);
        match mode {
            CloseMode::Graceful => self.effective().close(),
            CloseMode::Immediate => self.effective().shutdown(),
        }
    }

    /// Transport connected
    pub fn on_connected(&self) -> Result<(), SessionError> {
        self.dispatch("connected", |handler| match self.tls_session.get() {
            Some(tls) => {
                let result = Self::ensure_initialized(tls.as_ref())
                    .map_err(SessionError::from)
                    .and_then(|()| handler.connected(self));
                Self::route_tls_io(handler, tls.as_ref(), result, false)
            }
            None => handler.connected(self),
        })
    }

    /// Transport readable
    pub fn on_input_ready(&self) -> Result<(), SessionError> {
        self.dispatch("input", |handler| match self.tls_session.get() {
            Some(tls) => {
                let result = self.tls_input(handler, tls.as_ref());
                Self::route_tls_io(handler, tls.as_ref(), result, true)
            }
            None => handler.input_ready(self),
        })
    }

    /// Transport writable
    pub fn on_output_ready(&self) -> Result<(), SessionError> {
        self.dispatch("output", |handler| match self.tls_session.get() {
            Some(tls) => {
                let result = self.tls_output(handler, tls.as_ref());
                Self::route_tls_io(handler, tls.as_ref(), result, true)
            }
            None => handler.output_ready(self),
        })
    }

    /// Idle timeout elapsed
    pub fn on_timeout(&self) -> Result<(), SessionError> {
        self.dispatch("timeout", |handler| {
            handler.timeout(self)?;
            if let Some(tls) = self.tls_session.get() {
                if tls.is_outbound_done() && !tls.is_inbound_done() {
                    // The session failed to terminate cleanly
                    warn!("TLS close of {} incomplete at timeout, forcing shutdown", self);
                    tls.shutdown();
                }
            }
            Ok(())
        })
    }

    /// Transport disconnected
    pub fn on_disconnected(&self) -> Result<(), SessionError> {
        let handler = self.event_handler()?;
        handler.disconnected(self);
        Ok(())
    }

    fn tls_input(&self, handler: &dyn IoEventHandler, tls: &dyn TlsLayer) -> Result<(), SessionError> {
        Self::ensure_initialized(tls)?;
        if tls.is_app_input_ready()? {
            // One network read may have decrypted several records
            loop {
                handler.input_ready(self)?;
                if !tls.has_input_data() {
                    break;
                }
            }
        }
        tls.inbound_transport()?;
        Ok(())
    }

    fn tls_output(&self, handler: &dyn IoEventHandler, tls: &dyn TlsLayer) -> Result<(), SessionError> {
        Self::ensure_initialized(tls)?;
        if tls.is_app_output_ready()? {
            handler.output_ready(self)?;
        }
        tls.outbound_transport()?;
        Ok(())
    }

    fn ensure_initialized(tls: &dyn TlsLayer) -> std::io::Result<()> {
        if !tls.is_initialized() {
            tls.initialize()?;
        }
        Ok(())
    }

    /// Run `f` with the handler. Any error that reaches here, or a panic,
    /// shuts the session down.
    fn dispatch<F>(&self, event: &'static str, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&dyn IoEventHandler) -> Result<(), SessionError>,
    {
        let _guard = ShutdownOnPanic(self);
        let result = self
            .event_handler()
            .and_then(|handler| f(handler.as_ref()));
        if let Err(err) = &result {
            if err.is_recoverable() {
                debug!("I/O failure on {} during {} dispatch: {}", self, event, err);
            } else {
                warn!("fatal error on {} during {} dispatch: {}", self, event, err);
            }
            self.shutdown();
        }
        result
    }

    /// Report a recoverable TLS-path failure to the handler and swallow it
    fn route_tls_io(
        handler: &dyn IoEventHandler,
        tls: &dyn TlsLayer,
        result: Result<(), SessionError>,
        teardown: bool,
    ) -> Result<(), SessionError> {
        match result {
            Err(err) if !err.is_recoverable() => Err(err),
            Err(SessionError::Io(err)) => {
                debug!("TLS I/O error on {}: {}", tls.id(), err);
                handler.exception(tls.as_io_session(), &err);
                if teardown {
                    tls.shutdown();
                }
                Ok(())
            }
            other => other,
        }
    }
}

impl IoSession for ManagedSession {
    fn id(&self) -> SessionId {
        self.transport().id()
    }

    fn handler(&self) -> Option<Arc<dyn IoEventHandler>> {
        self.transport().handler()
    }

    fn set_handler(&self, handler: Arc<dyn IoEventHandler>) {
        self.transport().set_handler(handler);
    }

    fn channel(&self) -> &dyn ByteChannel {
        self.effective().channel()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport().remote_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.transport().local_addr()
    }

    fn event_mask(&self) -> EventMask {
        self.effective().event_mask()
    }

    fn set_event_mask(&self, mask: EventMask) {
        self.effective().set_event_mask(mask);
    }

    fn set_event(&self, op: EventMask) {
        self.effective().set_event(op);
    }

    fn clear_event(&self, op: EventMask) {
        self.effective().clear_event(op);
    }

    fn socket_timeout(&self) -> Option<Duration> {
        self.transport().socket_timeout()
    }

    fn set_socket_timeout(&self, timeout: Option<Duration>) {
        self.transport().set_socket_timeout(timeout);
    }

    fn add_last(&self, command: Arc<dyn Command>) {
        self.effective().add_last(command);
    }

    fn add_first(&self, command: Arc<dyn Command>) {
        self.effective().add_first(command);
    }

    fn enqueue(&self, command: Arc<dyn Command>, priority: CommandPriority) {
        self.effective().enqueue(command, priority);
    }

    fn poll_command(&self) -> Option<Arc<dyn Command>> {
        self.effective().poll_command()
    }

    fn status(&self) -> SessionStatus {
        self.effective().status()
    }

    fn is_closed(&self) -> bool {
        self.effective().is_closed()
    }

    fn close(&self) {
        self.terminate(CloseMode::Graceful);
    }

    fn shutdown(&self) {
        self.terminate(CloseMode::Immediate);
    }
}

/// Renders the effective session: `id [status][r:w][tls] -> endpoint`
impl fmt::Display for ManagedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.effective();
        let mask = session.event_mask();
        write!(
            f,
            "{} [{:?}][{}:{}]",
            session.id(),
            session.status(),
            if mask.contains(EventMask::READ) { 'r' } else { '-' },
            if mask.contains(EventMask::WRITE) { 'w' } else { '-' },
        )?;
        if self.is_tls_active() {
            f.write_str("[tls]")?;
        }
        if let Some(endpoint) = &self.endpoint {
            write!(f, " -> {}", endpoint)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSession")
            .field("id", &self.transport().id())
            .field("endpoint", &self.endpoint)
            .field("tls", &self.is_tls_active())
            .field("closed", &self.is_terminated())
            .finish()
    }
}

/// Enqueues the session into the closed registry when dropped
struct NotifyClosed<'a>(&'a ManagedSession);

impl Drop for NotifyClosed<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.0.this.upgrade() {
            self.0.closed_sessions.push(session);
        }
    }
}

/// Shuts the session down if dispatch unwinds
struct ShutdownOnPanic<'a>(&'a ManagedSession);

impl Drop for ShutdownOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("panic during dispatch on {}, shutting down", self.0);
            self.0.shutdown();
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
