//! Identifiers, interest masks and commands shared by all session kinds.

use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

/// Remote endpoint of a client-initiated session
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamedEndpoint {
    /// Host name, also used as TLS server name
    pub host: String,
    /// Port
    pub port: u16,
}

impl NamedEndpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NamedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

bitflags! {
    /// Readiness interest registered with the reactor
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// Interested in input
        const READ = 0b0001;
        /// Interested in output
        const WRITE = 0b0100;
    }
}

/// Lifecycle status of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// Open for I/O
    Active,
    /// Graceful close in progress
    Closing,
    /// Fully closed
    Closed,
}

/// Where a command is placed in the session's command queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandPriority {
    /// Appended behind queued commands
    Normal,
    /// Placed in front of queued commands
    Immediate,
}

/// Work item queued on a session for the protocol handler
pub trait Command: Send + Sync + fmt::Debug {
    /// Cancel the command. Returns `false` if it already completed.
    fn cancel(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_event_mask_ops() {
        let mut mask = EventMask::READ;
        mask |= EventMask::WRITE;
        assert!(mask.contains(EventMask::READ | EventMask::WRITE));
        mask.remove(EventMask::READ);
        assert_eq!(mask, EventMask::WRITE);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(NamedEndpoint::new("example.org", 443).to_string(), "example.org:443");
    }
}
