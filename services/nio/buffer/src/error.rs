//! Shared buffer error types.

use thiserror::Error;

/// Shared buffer errors
#[derive(Error, Debug)]
pub enum BufferError {
    /// The buffer was aborted before or while the caller was waiting
    #[error("operation aborted")]
    Aborted,

    /// I/O error reported by the output sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BufferError {
    /// Whether this error is a deliberate cancellation rather than a failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, BufferError::Aborted)
    }
}
