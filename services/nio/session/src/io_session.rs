//! Contracts between the reactor, transports and protocol handlers.

use crate::error::SessionError;
use crate::types::{Command, CommandPriority, EventMask, SessionId, SessionStatus};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Non-blocking byte channel.
///
/// `read` returns `Ok(0)` at end of stream and `ErrorKind::WouldBlock` when
/// no bytes are available yet. `write` may accept fewer bytes than offered,
/// including none.
pub trait ByteChannel: Send + Sync {
    /// Read available bytes into `dst`
    fn read(&self, dst: &mut [u8]) -> io::Result<usize>;
    /// Write as many bytes of `src` as the channel accepts
    fn write(&self, src: &[u8]) -> io::Result<usize>;
    /// Whether the channel is still open
    fn is_open(&self) -> bool;
}

/// A session over a non-blocking transport, as seen by the reactor and the
/// protocol handler.
pub trait IoSession: Send + Sync {
    /// Session identifier
    fn id(&self) -> SessionId;

    /// Attached protocol handler
    fn handler(&self) -> Option<Arc<dyn IoEventHandler>>;
    /// Attach the protocol handler
    fn set_handler(&self, handler: Arc<dyn IoEventHandler>);

    /// Channel used for application I/O
    fn channel(&self) -> &dyn ByteChannel;

    /// Address of the peer
    fn remote_addr(&self) -> Option<SocketAddr>;
    /// Local address
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Current interest set
    fn event_mask(&self) -> EventMask;
    /// Replace the interest set
    fn set_event_mask(&self, mask: EventMask);
    /// Add interest
    fn set_event(&self, op: EventMask);
    /// Remove interest
    fn clear_event(&self, op: EventMask);

    /// Idle timeout, `None` disables it
    fn socket_timeout(&self) -> Option<Duration>;
    /// Set the idle timeout
    fn set_socket_timeout(&self, timeout: Option<Duration>);

    /// Queue a command behind the others
    fn add_last(&self, command: Arc<dyn Command>) {
        self.enqueue(command, CommandPriority::Normal);
    }
    /// Queue a command in front of the others
    fn add_first(&self, command: Arc<dyn Command>) {
        self.enqueue(command, CommandPriority::Immediate);
    }
    /// Queue a command with the given priority
    fn enqueue(&self, command: Arc<dyn Command>, priority: CommandPriority);
    /// Take the next queued command
    fn poll_command(&self) -> Option<Arc<dyn Command>>;

    /// Lifecycle status
    fn status(&self) -> SessionStatus;
    /// Whether the session is fully closed
    fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    /// Graceful close
    fn close(&self);
    /// Immediate, abortive close
    fn shutdown(&self);
}

/// Protocol handler driven by the reactor through a managed session.
///
/// While TLS is active, a [`SessionError::Io`] returned from a callback is
/// treated as an ordinary network failure and reported back through
/// [`exception`](Self::exception). Any other error, and any error on a plain
/// session, shuts the session down and propagates to the reactor.
pub trait IoEventHandler: Send + Sync {
    /// Transport connected
    fn connected(&self, session: &dyn IoSession) -> Result<(), SessionError>;
    /// Application input available
    fn input_ready(&self, session: &dyn IoSession) -> Result<(), SessionError>;
    /// Application output possible
    fn output_ready(&self, session: &dyn IoSession) -> Result<(), SessionError>;
    /// Idle timeout elapsed
    fn timeout(&self, session: &dyn IoSession) -> Result<(), SessionError>;
    /// I/O failure observed on the session
    fn exception(&self, session: &dyn IoSession, cause: &io::Error);
    /// Session disconnected and released by the reactor
    fn disconnected(&self, session: &dyn IoSession);
}
