//! TLS layer backed by a sans-IO rustls connection.
//!
//! Ciphertext moves between the rustls connection and the raw transport's
//! [`ByteChannel`] only inside [`TlsLayer::inbound_transport`] and
//! [`TlsLayer::outbound_transport`]. The application reads and writes
//! plaintext through the layer's own channel.

use crate::error::SessionError;
use crate::io_session::{ByteChannel, IoEventHandler, IoSession};
use crate::tls::{
    TlsBufferStrategy, TlsContext, TlsDetails, TlsLayer, TlsLayerParams, TlsRole,
    TlsSessionInitializer, TlsSessionVerifier,
};
use crate::types::{Command, CommandPriority, EventMask, NamedEndpoint, SessionId, SessionStatus};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Size of the ciphertext scratch buffer: one maximal TLS record plus header
const SCRATCH_SIZE: usize = 16 * 1024 + 2048;

/// [`TlsContext`] holding rustls client and server configurations
#[derive(Clone, Default)]
pub struct RustlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl RustlsContext {
    /// Empty context; add configurations with `with_client` / `with_server`
    pub fn new() -> Self {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self::default()
    }

    /// Configuration used for client-initiated sessions
    pub fn with_client(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    /// Configuration used for accepted sessions
    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }
}

impl TlsContext for RustlsContext {
    fn create_layer(&self, params: TlsLayerParams) -> Result<Arc<dyn TlsLayer>, SessionError> {
        let conn = match params.role {
            TlsRole::Client => {
                let config = self
                    .client
                    .clone()
                    .ok_or_else(|| SessionError::Tls("no client configuration".into()))?;
                let endpoint = params
                    .endpoint
                    .as_ref()
                    .ok_or_else(|| SessionError::Tls("client session without endpoint".into()))?;
                let name = ServerName::try_from(endpoint.host.clone())
                    .map_err(|e| SessionError::Tls(format!("invalid server name: {}", e)))?;
                let client = ClientConnection::new(config, name)
                    .map_err(|e| SessionError::Tls(e.to_string()))?;
                Connection::Client(client)
            }
            TlsRole::Server => {
                let config = self
                    .server
                    .clone()
                    .ok_or_else(|| SessionError::Tls("no server configuration".into()))?;
                let server =
                    ServerConnection::new(config).map_err(|e| SessionError::Tls(e.to_string()))?;
                Connection::Server(server)
            }
        };
        Ok(Arc::new(RustlsSession::new(params, conn)))
    }
}

impl std::fmt::Debug for RustlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsContext")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

struct Inner {
    conn: Connection,
    /// Kept between operations with the static strategy only
    scratch: Vec<u8>,
    plaintext_pending: usize,
    handshake_done: bool,
    close_requested: bool,
    status: SessionStatus,
}

/// rustls connection layered over a raw transport
pub struct RustlsSession {
    endpoint: Option<NamedEndpoint>,
    role: TlsRole,
    transport: Arc<dyn IoSession>,
    buffer_strategy: TlsBufferStrategy,
    initializer: Option<Arc<dyn TlsSessionInitializer>>,
    verifier: Option<Arc<dyn TlsSessionVerifier>>,
    inner: Mutex<Inner>,
    /// Application interest
    app_mask: AtomicU32,
    initialized: AtomicBool,
    inbound_done: AtomicBool,
    outbound_done: AtomicBool,
}

impl RustlsSession {
    fn new(params: TlsLayerParams, conn: Connection) -> Self {
        let scratch = match params.buffer_strategy {
            TlsBufferStrategy::Static => vec![0; SCRATCH_SIZE],
            TlsBufferStrategy::Dynamic => Vec::new(),
        };
        Self {
            endpoint: params.endpoint,
            role: params.role,
            transport: params.transport,
            buffer_strategy: params.buffer_strategy,
            initializer: params.initializer,
            verifier: params.verifier,
            inner: Mutex::new(Inner {
                conn,
                scratch,
                plaintext_pending: 0,
                handshake_done: false,
                close_requested: false,
                status: SessionStatus::Active,
            }),
            app_mask: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            inbound_done: AtomicBool::new(false),
            outbound_done: AtomicBool::new(false),
        }
    }

    /// Handshake role of this layer
    pub fn role(&self) -> TlsRole {
        self.role
    }

    fn app_interest(&self) -> EventMask {
        EventMask::from_bits_truncate(self.app_mask.load(Ordering::Acquire))
    }

    fn take_scratch(&self, inner: &mut Inner) -> Vec<u8> {
        let mut buf = std::mem::take(&mut inner.scratch);
        buf.resize(SCRATCH_SIZE, 0);
        buf
    }

    fn release_scratch(&self, inner: &mut Inner, buf: Vec<u8>) {
        if self.buffer_strategy == TlsBufferStrategy::Static {
            inner.scratch = buf;
        }
    }

    fn read_transport(&self, inner: &mut Inner, buf: &mut [u8]) -> io::Result<()> {
        while inner.conn.wants_read() && !self.inbound_done.load(Ordering::Acquire) {
            let n = match self.transport.channel().read(buf) {
                Ok(0) => {
                    debug!("Transport of {} reached end of stream", self.transport.id());
                    self.inbound_done.store(true, Ordering::Release);
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };
            let mut records = &buf[..n];
            while !records.is_empty() {
                inner.conn.read_tls(&mut records)?;
                self.process_packets(inner)?;
            }
        }
        Ok(())
    }

    fn process_packets(&self, inner: &mut Inner) -> io::Result<()> {
        let state = match inner.conn.process_new_packets() {
            Ok(state) => state,
            Err(e) => {
                warn!("TLS failure on {}: {}", self.transport.id(), e);
                // Best effort to deliver the alert rustls queued
                let _ = self.write_transport(inner);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };
        inner.plaintext_pending = state.plaintext_bytes_to_read();
        if state.peer_has_closed() {
            self.inbound_done.store(true, Ordering::Release);
        }
        if !inner.handshake_done && !inner.conn.is_handshaking() {
            inner.handshake_done = true;
            let details = details_of(&inner.conn, self.endpoint.as_ref());
            if let Some(verifier) = &self.verifier {
                verifier.verify(self.endpoint.as_ref(), &details)?;
            }
            info!(
                "TLS handshake complete on {}: {:?} {:?}",
                self.transport.id(),
                details.protocol,
                details.cipher_suite
            );
        }
        Ok(())
    }

    fn write_transport(&self, inner: &mut Inner) -> io::Result<()> {
        let mut writer = TransportWriter(self.transport.channel());
        while inner.conn.wants_write() {
            match inner.conn.write_tls(&mut writer) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if inner.close_requested && !inner.conn.wants_write() {
            self.outbound_done.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Derive transport interest and finish a graceful close once both halves are done
    fn settle(&self, inner: &mut Inner) {
        if inner.status == SessionStatus::Closed {
            return;
        }
        let inbound_done = self.inbound_done.load(Ordering::Acquire);
        if inner.status == SessionStatus::Closing
            && inbound_done
            && self.outbound_done.load(Ordering::Acquire)
        {
            debug!("TLS close of {} complete", self.transport.id());
            inner.status = SessionStatus::Closed;
            self.transport.close();
            return;
        }
        let mut mask = EventMask::empty();
        if !inbound_done {
            mask |= EventMask::READ;
        }
        if inner.conn.wants_write()
            || (inner.status == SessionStatus::Active && self.app_interest().contains(EventMask::WRITE))
        {
            mask |= EventMask::WRITE;
        }
        self.transport.set_event_mask(mask);
    }
}

impl ByteChannel for RustlsSession {
    fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let n = inner.conn.reader().read(dst)?;
        inner.plaintext_pending = inner.plaintext_pending.saturating_sub(n);
        Ok(n)
    }

    fn write(&self, src: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if inner.status != SessionStatus::Active {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "TLS session closing"));
        }
        let n = inner.conn.writer().write(src)?;
        self.settle(&mut inner);
        Ok(n)
    }

    fn is_open(&self) -> bool {
        self.inner.lock().status != SessionStatus::Closed
    }
}

impl IoSession for RustlsSession {
    fn id(&self) -> SessionId {
        self.transport.id()
    }

    fn handler(&self) -> Option<Arc<dyn IoEventHandler>> {
        self.transport.handler()
    }

    fn set_handler(&self, handler: Arc<dyn IoEventHandler>) {
        self.transport.set_handler(handler);
    }

    fn channel(&self) -> &dyn ByteChannel {
        self
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    fn event_mask(&self) -> EventMask {
        self.app_interest()
    }

    fn set_event_mask(&self, mask: EventMask) {
        self.app_mask.store(mask.bits(), Ordering::Release);
        self.settle(&mut self.inner.lock());
    }

    fn set_event(&self, op: EventMask) {
        self.app_mask.fetch_or(op.bits(), Ordering::AcqRel);
        self.settle(&mut self.inner.lock());
    }

    fn clear_event(&self, op: EventMask) {
        self.app_mask.fetch_and(!op.bits(), Ordering::AcqRel);
        self.settle(&mut self.inner.lock());
    }

    fn socket_timeout(&self) -> Option<Duration> {
        self.transport.socket_timeout()
    }

    fn set_socket_timeout(&self, timeout: Option<Duration>) {
        self.transport.set_socket_timeout(timeout);
    }

    fn enqueue(&self, command: Arc<dyn Command>, priority: CommandPriority) {
        self.transport.enqueue(command, priority);
    }

    fn poll_command(&self) -> Option<Arc<dyn Command>> {
        self.transport.poll_command()
    }

    fn status(&self) -> SessionStatus {
        self.inner.lock().status
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.status != SessionStatus::Active {
            return;
        }
        debug!("Sending close_notify on {}", self.transport.id());
        inner.status = SessionStatus::Closing;
        inner.close_requested = true;
        inner.conn.send_close_notify();
        if let Err(e) = self.write_transport(&mut inner) {
            debug!("close_notify on {} not delivered: {}", self.transport.id(), e);
        }
        self.settle(&mut inner);
    }

    fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.status == SessionStatus::Closed {
            return;
        }
        inner.status = SessionStatus::Closed;
        drop(inner);
        self.transport.shutdown();
    }
}

impl TlsLayer for RustlsSession {
    fn as_io_session(&self) -> &dyn IoSession {
        self
    }

    fn initialize(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(initializer) = &self.initializer {
            initializer.initialize(self.endpoint.as_ref(), self.role)?;
        }
        let mut inner = self.inner.lock();
        self.write_transport(&mut inner)?;
        self.settle(&mut inner);
        self.initialized.store(true, Ordering::Release);
        debug!("TLS {:?} handshake started on {}", self.role, self.transport.id());
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn is_app_input_ready(&self) -> io::Result<bool> {
        let inner = self.inner.lock();
        let wants_input = self.app_interest().contains(EventMask::READ);
        let end_of_stream =
            self.inbound_done.load(Ordering::Acquire) && inner.status == SessionStatus::Active;
        Ok(wants_input && (inner.plaintext_pending > 0 || end_of_stream))
    }

    fn has_input_data(&self) -> bool {
        self.inner.lock().plaintext_pending > 0
    }

    fn is_app_output_ready(&self) -> io::Result<bool> {
        let inner = self.inner.lock();
        Ok(self.app_interest().contains(EventMask::WRITE)
            && inner.status == SessionStatus::Active
            && !inner.conn.is_handshaking())
    }

    fn inbound_transport(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let mut buf = self.take_scratch(&mut inner);
        let result = self.read_transport(&mut inner, &mut buf);
        self.release_scratch(&mut inner, buf);
        result?;
        // Handshake replies and alerts go out right away
        self.write_transport(&mut inner)?;
        self.settle(&mut inner);
        Ok(())
    }

    fn outbound_transport(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        self.write_transport(&mut inner)?;
        self.settle(&mut inner);
        Ok(())
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done.load(Ordering::Acquire)
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done.load(Ordering::Acquire)
    }

    fn tls_details(&self) -> Option<TlsDetails> {
        let inner = self.inner.lock();
        if inner.conn.is_handshaking() {
            return None;
        }
        Some(details_of(&inner.conn, self.endpoint.as_ref()))
    }
}

impl std::fmt::Debug for RustlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsSession")
            .field("id", &self.transport.id())
            .field("role", &self.role)
            .field("buffer_strategy", &self.buffer_strategy)
            .field("inbound_done", &self.is_inbound_done())
            .field("outbound_done", &self.is_outbound_done())
            .finish()
    }
}

fn details_of(conn: &Connection, endpoint: Option<&NamedEndpoint>) -> TlsDetails {
    let server_name = match conn {
        Connection::Server(server) => server.server_name().map(str::to_owned),
        Connection::Client(_) => endpoint.map(|e| e.host.clone()),
    };
    TlsDetails {
        protocol: conn.protocol_version().map(|v| format!("{:?}", v)),
        cipher_suite: conn.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())),
        alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
        server_name,
        peer_certificates: conn.peer_certificates().map_or(0, |certs| certs.len()),
    }
}

/// `io::Write` over a non-blocking channel; a zero-length write means the channel is full
struct TransportWriter<'a>(&'a dyn ByteChannel);

impl Write for TransportWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.write(buf)? {
            0 if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
