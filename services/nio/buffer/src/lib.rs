//! Bounded, flow-controlled output buffer for the nio reactor.
//!
//! This crate provides the hand-off point between a producer thread that
//! generates message content and the single reactor thread that owns the
//! transport. The producer blocks when the sink is saturated; the reactor
//! never blocks on the producer.
//!
//! ## Features
//!
//! - **Small-chunk coalescing**: writes under 1 KiB are copied into the buffer
//! - **Direct writes**: larger chunks bypass the buffer when it is empty
//! - **Backpressure**: producers wait until the reactor signals capacity
//! - **Abort**: cancellation wakes and fails every blocked producer
//! - **Shared lock**: buffers of one exchange can wait on one [`BufferLock`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use nio_buffer::{DataStreamChannel, SharedOutputBuffer};
//! use std::sync::Arc;
//!
//! # fn example(sink: Arc<dyn DataStreamChannel>) -> Result<(), nio_buffer::BufferError> {
//! let buffer = Arc::new(SharedOutputBuffer::new(8 * 1024));
//!
//! // Producer thread
//! let producer = Arc::clone(&buffer);
//! std::thread::spawn(move || {
//!     producer.write(b"hello world")?;
//!     producer.write_completed()
//! });
//!
//! // Reactor thread, whenever the transport is writable
//! buffer.flush(sink)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod modal;
pub mod shared;

// Re-export main types
pub use channel::DataStreamChannel;
pub use error::BufferError;
pub use modal::{BufferMode, ModalBuffer};
pub use shared::{BufferLock, SharedOutputBuffer, SMALL_CHUNK_THRESHOLD};
