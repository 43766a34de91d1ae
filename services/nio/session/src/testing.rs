//! Recording handler and scripted TLS layer shared by unit tests.

use crate::error::SessionError;
use crate::io_session::{ByteChannel, IoEventHandler, IoSession};
use crate::memory::MemorySession;
use crate::tls::{TlsBufferStrategy, TlsContext, TlsDetails, TlsLayer, TlsLayerParams, TlsRole};
use crate::types::{Command, CommandPriority, EventMask, SessionId, SessionStatus};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandlerCall {
    Connected,
    InputReady,
    OutputReady,
    Timeout,
    Exception(io::ErrorKind),
    Disconnected,
}

type ErrorFactory = Box<dyn Fn() -> SessionError + Send + Sync>;

#[derive(Default)]
pub(crate) struct RecordingHandler {
    calls: Mutex<Vec<HandlerCall>>,
    failure: Mutex<Option<ErrorFactory>>,
    panic: AtomicBool,
}

impl RecordingHandler {
    pub(crate) fn calls(&self) -> Vec<HandlerCall> {
        self.calls.lock().clone()
    }

    pub(crate) fn fail_with(&self, factory: impl Fn() -> SessionError + Send + Sync + 'static) {
        *self.failure.lock() = Some(Box::new(factory));
    }

    pub(crate) fn panic_on_callback(&self, enabled: bool) {
        self.panic.store(enabled, Ordering::SeqCst);
    }

    fn record(&self, call: HandlerCall) -> Result<(), SessionError> {
        self.calls.lock().push(call);
        if self.panic.load(Ordering::SeqCst) {
            panic!("handler defect");
        }
        match self.failure.lock().as_ref() {
            Some(factory) => Err(factory()),
            None => Ok(()),
        }
    }
}

impl IoEventHandler for RecordingHandler {
    fn connected(&self, _session: &dyn IoSession) -> Result<(), SessionError> {
        self.record(HandlerCall::Connected)
    }

    fn input_ready(&self, _session: &dyn IoSession) -> Result<(), SessionError> {
        self.record(HandlerCall::InputReady)
    }

    fn output_ready(&self, _session: &dyn IoSession) -> Result<(), SessionError> {
        self.record(HandlerCall::OutputReady)
    }

    fn timeout(&self, _session: &dyn IoSession) -> Result<(), SessionError> {
        self.record(HandlerCall::Timeout)
    }

    fn exception(&self, _session: &dyn IoSession, cause: &io::Error) {
        self.calls.lock().push(HandlerCall::Exception(cause.kind()));
    }

    fn disconnected(&self, _session: &dyn IoSession) {
        self.calls.lock().push(HandlerCall::Disconnected);
    }
}

/// TLS layer whose predicates are set by the test
pub(crate) struct MockTlsLayer {
    role: TlsRole,
    buffer_strategy: TlsBufferStrategy,
    transport: Arc<dyn IoSession>,
    app: MemorySession,
    initialized: AtomicBool,
    initialize_failure: Mutex<Option<io::ErrorKind>>,
    app_input_ready: AtomicBool,
    app_output_ready: AtomicBool,
    buffered_records: AtomicUsize,
    outbound_done: AtomicBool,
    inbound_done: AtomicBool,
    initialize_calls: AtomicUsize,
    inbound_calls: AtomicUsize,
    outbound_calls: AtomicUsize,
}

impl MockTlsLayer {
    fn new(params: TlsLayerParams) -> Self {
        Self {
            role: params.role,
            buffer_strategy: params.buffer_strategy,
            transport: params.transport,
            app: MemorySession::new(None, None),
            initialized: AtomicBool::new(false),
            initialize_failure: Mutex::new(None),
            app_input_ready: AtomicBool::new(false),
            app_output_ready: AtomicBool::new(false),
            buffered_records: AtomicUsize::new(0),
            outbound_done: AtomicBool::new(false),
            inbound_done: AtomicBool::new(false),
            initialize_calls: AtomicUsize::new(0),
            inbound_calls: AtomicUsize::new(0),
            outbound_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn role(&self) -> TlsRole {
        self.role
    }

    pub(crate) fn buffer_strategy(&self) -> TlsBufferStrategy {
        self.buffer_strategy
    }

    pub(crate) fn fail_initialize(&self, kind: io::ErrorKind) {
        *self.initialize_failure.lock() = Some(kind);
    }

    pub(crate) fn set_app_input_ready(&self, ready: bool) {
        self.app_input_ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn set_app_output_ready(&self, ready: bool) {
        self.app_output_ready.store(ready, Ordering::SeqCst);
    }

    pub(crate) fn set_buffered_records(&self, records: usize) {
        self.buffered_records.store(records, Ordering::SeqCst);
    }

    pub(crate) fn set_done(&self, outbound: bool, inbound: bool) {
        self.outbound_done.store(outbound, Ordering::SeqCst);
        self.inbound_done.store(inbound, Ordering::SeqCst);
    }

    pub(crate) fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn inbound_calls(&self) -> usize {
        self.inbound_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn outbound_calls(&self) -> usize {
        self.outbound_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.app.close_calls()
    }

    pub(crate) fn shutdown_calls(&self) -> usize {
        self.app.shutdown_calls()
    }
}

impl fmt::Debug for MockTlsLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTlsLayer")
            .field("id", &self.transport.id())
            .field("role", &self.role)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl IoSession for MockTlsLayer {
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
        self.app.channel()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    fn event_mask(&self) -> EventMask {
        self.app.event_mask()
    }

    fn set_event_mask(&self, mask: EventMask) {
        self.app.set_event_mask(mask);
    }

    fn set_event(&self, op: EventMask) {
        self.app.set_event(op);
    }

    fn clear_event(&self, op: EventMask) {
        self.app.clear_event(op);
    }

    fn socket_timeout(&self) -> Option<Duration> {
        self.transport.socket_timeout()
    }

    fn set_socket_timeout(&self, timeout: Option<Duration>) {
        self.transport.set_socket_timeout(timeout);
    }

    fn enqueue(&self, command: Arc<dyn Command>, priority: CommandPriority) {
        self.app.enqueue(command, priority);
    }

    fn poll_command(&self) -> Option<Arc<dyn Command>> {
        self.app.poll_command()
    }

    fn status(&self) -> SessionStatus {
        self.app.status()
    }

    fn close(&self) {
        self.app.close();
    }

    fn shutdown(&self) {
        self.app.shutdown();
    }
}

impl TlsLayer for MockTlsLayer {
    fn as_io_session(&self) -> &dyn IoSession {
        self
    }

    fn initialize(&self) -> io::Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.initialize_failure.lock() {
            return Err(io::Error::new(kind, "handshake failed"));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn is_app_input_ready(&self) -> io::Result<bool> {
        Ok(self.app_input_ready.load(Ordering::SeqCst))
    }

    fn has_input_data(&self) -> bool {
        self.buffered_records
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn is_app_output_ready(&self) -> io::Result<bool> {
        Ok(self.app_output_ready.load(Ordering::SeqCst))
    }

    fn inbound_transport(&self) -> io::Result<()> {
        self.inbound_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn outbound_transport(&self) -> io::Result<()> {
        self.outbound_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done.load(Ordering::SeqCst)
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done.load(Ordering::SeqCst)
    }

    fn tls_details(&self) -> Option<TlsDetails> {
        None
    }
}

#[derive(Default)]
pub(crate) struct MockTlsContext {
    layers: Mutex<Vec<Arc<MockTlsLayer>>>,
}

impl MockTlsContext {
    pub(crate) fn created(&self) -> usize {
        self.layers.lock().len()
    }

    pub(crate) fn last_layer(&self) -> Option<Arc<MockTlsLayer>> {
        self.layers.lock().last().cloned()
    }
}

impl TlsContext for MockTlsContext {
    fn create_layer(&self, params: TlsLayerParams) -> Result<Arc<dyn TlsLayer>, SessionError> {
        let layer = Arc::new(MockTlsLayer::new(params));
        self.layers.lock().push(Arc::clone(&layer));
        Ok(layer)
    }
}
