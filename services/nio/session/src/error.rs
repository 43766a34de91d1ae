//! Session error types.
//!
//! Only [`SessionError::Io`] is recoverable: while TLS is active it is
//! routed to the handler's exception callback. Every other error that
//! escapes dispatch shuts the session down and propagates to the reactor.

use thiserror::Error;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Network or TLS transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `start_tls` called on a session that already has a TLS layer
    #[error("TLS already activated")]
    TlsAlreadyActive,

    /// No event handler attached to the transport
    #[error("IO event handler not set")]
    MissingHandler,

    /// Handler reported an unrecoverable failure
    #[error("handler failure: {0}")]
    Handler(String),

    /// TLS layer could not be created
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl SessionError {
    /// Whether the error is an ordinary I/O condition the handler can react to
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::Io(_))
    }
}
