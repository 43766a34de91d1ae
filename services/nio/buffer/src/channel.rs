//! Output sink contract consumed by the shared buffer.

use std::io;

/// Non-blocking sink that drains a [`SharedOutputBuffer`](crate::SharedOutputBuffer).
///
/// Implementations are driven by the reactor in `flush` and, for large
/// chunks, directly by the producer thread. None of the methods may call
/// back into the buffer that invoked them.
pub trait DataStreamChannel: Send + Sync {
    /// Write as many bytes of `src` as the transport accepts right now.
    ///
    /// Returns the number of bytes accepted. `0` means the sink is
    /// saturated for the current flush cycle.
    fn write(&self, src: &[u8]) -> io::Result<usize>;

    /// Signal that no more content follows.
    fn end_stream(&self) -> io::Result<()>;

    /// Ask the reactor to invoke output dispatch again later.
    fn request_output(&self);
}
