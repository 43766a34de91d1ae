//! Output buffer shared between a producer thread and the reactor.
//!
//! The producer side (`write`, `write_byte`, `write_completed`) may run on
//! any thread, one producer at a time. The consumer side (`flush`) runs
//! only on the reactor thread and never waits on the producer.
//!
//! Buffers of one exchange may share a [`BufferLock`] so that a single
//! condition covers all of them.

use crate::channel::DataStreamChannel;
use crate::error::BufferError;
use crate::modal::{BufferMode, ModalBuffer};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Chunks shorter than this are always copied into the buffer when they fit
pub const SMALL_CHUNK_THRESHOLD: usize = 1024;

/// State guarded by the buffer lock
struct State {
    /// Pending content
    buffer: ModalBuffer,
    /// Sink attached by the most recent flush
    channel: Option<Arc<dyn DataStreamChannel>>,
    /// Whether the sink can accept bytes in the current flush cycle
    has_capacity: bool,
    /// No further input will arrive
    end_stream: bool,
    /// Cancelled by an external party
    aborted: bool,
}

/// Lock and wait condition guarding one or more buffers.
///
/// Every mutation of a buffer happens while holding this lock, and every
/// flush or abort wakes all producers waiting on any buffer that shares it.
/// Sink callbacks run under the lock and must not call back into a buffer
/// that shares it.
#[derive(Default)]
pub struct BufferLock {
    mutex: Mutex<()>,
    condition: Condvar,
}

impl BufferLock {
    /// Create a lock to hand to [`SharedOutputBuffer::with_lock`]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl fmt::Debug for BufferLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLock")
            .field("locked", &self.mutex.is_locked())
            .finish()
    }
}

/// Bounded, flow-controlled output buffer.
///
/// `has_capacity` is set only by [`flush`](Self::flush) and cleared only when
/// a direct write to the sink is refused. A blocked producer re-checks both
/// the pending bytes and the capacity flag after every wake-up.
pub struct SharedOutputBuffer {
    lock: Arc<BufferLock>,
    /// Only taken while holding `lock`, except by read-only queries
    state: Mutex<State>,
}

impl SharedOutputBuffer {
    /// Create a buffer holding at most `capacity` pending bytes
    pub fn new(capacity: usize) -> Self {
        Self::with_lock(BufferLock::new(), capacity)
    }

    /// Create a buffer guarded by a lock shared with other buffers
    pub fn with_lock(lock: Arc<BufferLock>, capacity: usize) -> Self {
        assert!(capacity > 0, "SharedOutputBuffer capacity must be positive");
        Self {
            lock,
            state: Mutex::new(State {
                buffer: ModalBuffer::with_capacity(capacity),
                channel: None,
                has_capacity: false,
                end_stream: false,
                aborted: false,
            }),
        }
    }

    /// Lock guarding this buffer
    pub fn shared_lock(&self) -> &Arc<BufferLock> {
        &self.lock
    }

    fn acquire(&self) -> (MutexGuard<'_, ()>, MutexGuard<'_, State>) {
        let guard = self.lock.mutex.lock();
        (guard, self.state.lock())
    }

    /// Drain pending bytes into `channel` and release any waiting producer.
    ///
    /// Called by the reactor whenever the transport is writable.
    pub fn flush(&self, channel: Arc<dyn DataStreamChannel>) -> Result<(), BufferError> {
        let (_guard, mut state) = self.acquire();
        state.channel = Some(Arc::clone(&channel));
        state.has_capacity = true;
        state.buffer.set_output_mode();

        let result = Self::drain_into(&mut state, channel.as_ref());
        self.lock.condition.notify_all();
        result
    }

    fn drain_into(state: &mut State, channel: &dyn DataStreamChannel) -> Result<(), BufferError> {
        if !state.buffer.is_empty() {
            let pending = state.buffer.len();
            let written = channel.write(state.buffer.unread())?.min(pending);
            state.buffer.consume(written);
            trace!("flushed {} of {} pending bytes", written, pending);
        }
        if state.buffer.is_empty() && state.end_stream {
            debug!("output buffer drained, signalling end of stream");
            channel.end_stream()?;
        }
        Ok(())
    }

    /// Append `src`, blocking while the sink is saturated.
    ///
    /// Fails with [`BufferError::Aborted`] if the buffer is aborted before or
    /// during the wait.
    pub fn write(&self, src: &[u8]) -> Result<(), BufferError> {
        let mut src = src;
        let (mut guard, mut state) = self.acquire();
        Self::ensure_not_aborted(&state)?;
        state.buffer.set_input_mode();

        while !src.is_empty() {
            // always buffer small chunks
            if src.len() < SMALL_CHUNK_THRESHOLD && state.buffer.free() > src.len() {
                state.buffer.put(src);
                break;
            }

            if !state.buffer.is_empty() || state.channel.is_none() {
                self.wait_flush(&mut guard, &mut state)?;
            }
            if state.buffer.is_empty() {
                if let Some(channel) = state.channel.clone() {
                    let written = channel.write(src)?.min(src.len());
                    src = &src[written..];
                    if written == 0 {
                        state.has_capacity = false;
                        self.wait_flush(&mut guard, &mut state)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Append a single byte, blocking while the buffer is full.
    pub fn write_byte(&self, b: u8) -> Result<(), BufferError> {
        let (mut guard, mut state) = self.acquire();
        Self::ensure_not_aborted(&state)?;
        state.buffer.set_input_mode();
        if state.buffer.free() == 0 {
            self.wait_flush(&mut guard, &mut state)?;
        }
        state.buffer.put_byte(b);
        Ok(())
    }

    /// Mark the end of the stream. Repeated calls are no-ops.
    ///
    /// With bytes still pending the sink is asked for another output cycle
    /// and the end-of-stream signal follows once those bytes are flushed.
    pub fn write_completed(&self) -> Result<(), BufferError> {
        let (_guard, mut state) = self.acquire();
        if state.end_stream {
            return Ok(());
        }
        state.end_stream = true;
        if let Some(channel) = state.channel.clone() {
            state.buffer.set_output_mode();
            if !state.buffer.is_empty() {
                channel.request_output();
            } else {
                channel.end_stream()?;
            }
        }
        Ok(())
    }

    /// Cancel the buffer, failing all current and future producer calls
    pub fn abort(&self) {
        let (_guard, mut state) = self.acquire();
        state.aborted = true;
        debug!("output buffer aborted with {} bytes pending", state.buffer.len());
        self.lock.condition.notify_all();
    }

    /// Whether [`abort`](Self::abort) was called
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Whether the producer signalled end of stream
    pub fn is_end_stream(&self) -> bool {
        self.state.lock().end_stream
    }

    /// Number of pending bytes
    pub fn length(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Whether any bytes are pending
    pub fn has_data(&self) -> bool {
        !self.state.lock().buffer.is_empty()
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.state.lock().buffer.capacity()
    }

    /// Clear content, sink and flags so the buffer can serve another exchange.
    ///
    /// Must not be called while a producer is blocked.
    pub fn reset(&self) {
        let (_guard, mut state) = self.acquire();
        state.buffer.clear();
        state.channel = None;
        state.has_capacity = false;
        state.end_stream = false;
        state.aborted = false;
    }

    fn ensure_not_aborted(state: &State) -> Result<(), BufferError> {
        if state.aborted {
            return Err(BufferError::Aborted);
        }
        Ok(())
    }

    /// Wait on the shared condition until a flush leaves the buffer empty with
    /// capacity. The state lock is released while waiting.
    fn wait_flush(
        &self,
        guard: &mut MutexGuard<'_, ()>,
        state: &mut MutexGuard<'_, State>,
    ) -> Result<(), BufferError> {
        state.buffer.set_output_mode();
        if let Some(channel) = &state.channel {
            channel.request_output();
        }
        Self::ensure_not_aborted(state)?;
        while !state.buffer.is_empty() || !state.has_capacity {
            trace!(
                "producer waiting: pending={} has_capacity={}",
                state.buffer.len(),
                state.has_capacity
            );
            MutexGuard::unlocked(state, || self.lock.condition.wait(guard));
            Self::ensure_not_aborted(state)?;
        }
        state.buffer.set_input_mode();
        Ok(())
    }
}

impl fmt::Debug for SharedOutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedOutputBuffer")
            .field("pending", &state.buffer.len())
            .field("capacity", &state.buffer.capacity())
            .field("input_mode", &(state.buffer.mode() == BufferMode::Input))
            .field("has_capacity", &state.has_capacity)
            .field("end_stream", &state.end_stream)
            .field("aborted", &state.aborted)
            .finish()
    }
}
