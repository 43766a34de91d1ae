//! In-memory transport for development and testing

use crate::io_session::{ByteChannel, IoEventHandler, IoSession};
use crate::types::{Command, CommandPriority, EventMask, SessionId, SessionStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Non-blocking channel over in-memory byte queues
#[derive(Debug)]
pub struct MemoryChannel {
    /// Bytes waiting to be read by the session
    inbound: Mutex<VecDeque<u8>>,
    /// Bytes written by the session
    outbound: Mutex<Vec<u8>>,
    /// Bytes the channel still accepts, `None` for unlimited
    write_window: Mutex<Option<usize>>,
    /// Peer closed its side
    eof: AtomicBool,
    open: AtomicBool,
}

impl MemoryChannel {
    fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
            write_window: Mutex::new(None),
            eof: AtomicBool::new(false),
            open: AtomicBool::new(true),
        }
    }

    /// Make bytes available to `read`
    pub fn feed(&self, data: &[u8]) {
        self.inbound.lock().extend(data.iter().copied());
    }

    /// Mark the peer side closed; `read` returns `Ok(0)` once drained
    pub fn set_eof(&self) {
        self.eof.store(true, Ordering::Release);
    }

    /// Limit how many more bytes `write` accepts. `Some(0)` saturates the channel.
    pub fn set_write_window(&self, window: Option<usize>) {
        *self.write_window.lock() = window;
    }

    /// Take everything written so far
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound.lock())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl ByteChannel for MemoryChannel {
    fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock();
        if inbound.is_empty() {
            if self.eof.load(Ordering::Acquire) || !self.is_open() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = dst.len().min(inbound.len());
        for (slot, byte) in dst.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, src: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        let mut window = self.write_window.lock();
        let n = match window.as_mut() {
            Some(remaining) => {
                let n = src.len().min(*remaining);
                *remaining -= n;
                n
            }
            None => src.len(),
        };
        self.outbound.lock().extend_from_slice(&src[..n]);
        Ok(n)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Raw session over a [`MemoryChannel`]
pub struct MemorySession {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    handler: RwLock<Option<Arc<dyn IoEventHandler>>>,
    channel: MemoryChannel,
    event_mask: AtomicU32,
    socket_timeout: Mutex<Option<Duration>>,
    commands: Mutex<VecDeque<Arc<dyn Command>>>,
    status: Mutex<SessionStatus>,
    close_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
    #[cfg(test)]
    panic_on_close: AtomicBool,
}

impl MemorySession {
    /// Create an open session
    pub fn new(remote_addr: Option<SocketAddr>, local_addr: Option<SocketAddr>) -> Self {
        Self {
            id: SessionId::next(),
            remote_addr,
            local_addr,
            handler: RwLock::new(None),
            channel: MemoryChannel::new(),
            event_mask: AtomicU32::new(0),
            socket_timeout: Mutex::new(None),
            commands: Mutex::new(VecDeque::new()),
            status: Mutex::new(SessionStatus::Active),
            close_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
            #[cfg(test)]
            panic_on_close: AtomicBool::new(false),
        }
    }

    /// The concrete channel, for feeding input and inspecting output
    pub fn memory_channel(&self) -> &MemoryChannel {
        &self.channel
    }

    /// Number of graceful closes received
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Number of immediate shutdowns received
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn panic_on_close(&self, enabled: bool) {
        self.panic_on_close.store(enabled, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn close_fault(&self) {
        if self.panic_on_close.load(Ordering::SeqCst) {
            panic!("transport close failed");
        }
    }

    #[cfg(not(test))]
    fn close_fault(&self) {}

    fn mark_closed(&self) {
        *self.status.lock() = SessionStatus::Closed;
        self.channel.close();
        for command in self.commands.lock().drain(..) {
            command.cancel();
        }
    }
}

impl IoSession for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn handler(&self) -> Option<Arc<dyn IoEventHandler>> {
        self.handler.read().clone()
    }

    fn set_handler(&self, handler: Arc<dyn IoEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn channel(&self) -> &dyn ByteChannel {
        &self.channel
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn event_mask(&self) -> EventMask {
        EventMask::from_bits_truncate(self.event_mask.load(Ordering::Acquire))
    }

    fn set_event_mask(&self, mask: EventMask) {
        self.event_mask.store(mask.bits(), Ordering::Release);
    }

    fn set_event(&self, op: EventMask) {
        self.event_mask.fetch_or(op.bits(), Ordering::AcqRel);
    }

    fn clear_event(&self, op: EventMask) {
        self.event_mask.fetch_and(!op.bits(), Ordering::AcqRel);
    }

    fn socket_timeout(&self) -> Option<Duration> {
        *self.socket_timeout.lock()
    }

    fn set_socket_timeout(&self, timeout: Option<Duration>) {
        *self.socket_timeout.lock() = timeout;
    }

    fn enqueue(&self, command: Arc<dyn Command>, priority: CommandPriority) {
        let mut commands = self.commands.lock();
        match priority {
            CommandPriority::Normal => commands.push_back(command),
            CommandPriority::Immediate => commands.push_front(command),
        }
    }

    fn poll_command(&self) -> Option<Arc<dyn Command>> {
        self.commands.lock().pop_front()
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.close_fault();
        debug!("Memory session {} closed", self.id);
        self.mark_closed();
    }

    fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        debug!("Memory session {} shut down", self.id);
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Flag(AtomicBool);

    impl Command for Flag {
        fn cancel(&self) -> bool {
            !self.0.swap(true, Ordering::SeqCst)
        }
    }

    #[test]
    fn test_channel_read_would_block_then_eof() {
        let session = MemorySession::new(None, None);
        let mut buf = [0u8; 8];

        let err = session.channel().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        session.memory_channel().feed(b"hi");
        assert_eq!(session.channel().read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");

        session.memory_channel().set_eof();
        assert_eq!(session.channel().read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_channel_write_window() {
        let session = MemorySession::new(None, None);
        let channel = session.memory_channel();
        channel.set_write_window(Some(3));

        assert_eq!(session.channel().write(b"abcdef").unwrap(), 3);
        assert_eq!(session.channel().write(b"def").unwrap(), 0);
        channel.set_write_window(None);
        assert_eq!(session.channel().write(b"def").unwrap(), 3);
        assert_eq!(channel.take_outbound(), b"abcdef");
    }

    #[test]
    fn test_command_priority_and_cancel_on_close() {
        let session = MemorySession::new(None, None);
        let first = Arc::new(Flag::default());
        let urgent = Arc::new(Flag::default());
        session.add_last(first.clone());
        session.add_first(urgent.clone());

        // The immediate command comes out first
        let polled = session.poll_command().unwrap();
        assert!(polled.cancel());
        assert!(urgent.0.load(Ordering::SeqCst));
        assert!(!first.0.load(Ordering::SeqCst));

        session.close();
        assert!(first.0.load(Ordering::SeqCst));
        assert!(session.is_closed());
        assert!(session.channel().write(b"x").is_err());
    }
}
