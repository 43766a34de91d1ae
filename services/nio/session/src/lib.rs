//! Managed transport sessions for the nio reactor.
//!
//! This crate wraps raw non-blocking transports in a [`ManagedSession`]
//! that can layer TLS over the transport after the fact and dispatches
//! reactor readiness events to a protocol [`IoEventHandler`].
//!
//! ## Features
//!
//! - **Transparent TLS**: after [`ManagedSession::start_tls`] all effective
//!   I/O goes through the TLS layer while addresses and timeouts still come
//!   from the raw transport
//! - **Exactly-once close**: concurrent close/shutdown requests produce one
//!   transport side effect and one entry in the reactor's closed queue
//! - **Error routing**: I/O failures inside the TLS layer reach the
//!   handler's `exception` callback, everything else shuts the session down
//! - **Registry**: [`SessionRegistry`] tracks live sessions, idle timeouts
//!   and releases closed sessions
//! - **rustls layer** (feature `tls`): a sans-IO rustls connection driven
//!   over any [`ByteChannel`]
//!
//! ## Example
//!
//! ```rust
//! use nio_session::{MemorySession, SessionRegistry, EventMask, IoSession};
//! use std::sync::Arc;
//!
//! let registry = SessionRegistry::default();
//! let raw = Arc::new(MemorySession::new(None, None));
//! let session = registry.register(None, raw);
//! session.set_event(EventMask::READ);
//!
//! session.close();
//! assert_eq!(registry.drain_closed(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod io_session;
pub mod managed;
pub mod memory;
pub mod registry;
pub mod tls;
pub mod types;

#[cfg(feature = "tls")]
pub mod rustls_layer;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::SessionConfig;
pub use error::SessionError;
pub use io_session::{ByteChannel, IoEventHandler, IoSession};
pub use managed::ManagedSession;
pub use memory::{MemoryChannel, MemorySession};
pub use registry::{ClosedSessions, SessionRegistry};
pub use tls::{
    TlsBufferStrategy, TlsContext, TlsDetails, TlsLayer, TlsLayerParams, TlsRole,
    TlsSessionInitializer, TlsSessionVerifier,
};
pub use types::{Command, CommandPriority, EventMask, NamedEndpoint, SessionId, SessionStatus};

#[cfg(feature = "tls")]
pub use rustls_layer::{RustlsContext, RustlsSession};
