//! Fixed-capacity byte buffer with explicit input and output modes.

/// Addressing mode of a [`ModalBuffer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    /// Bytes are appended at the write position
    Input,
    /// Bytes are consumed from the read position up to the write position
    Output,
}

/// Byte buffer that is either being filled or being drained, never both.
///
/// Switching back to input mode compacts any unread bytes to the front so
/// that the full free space is available to the producer again.
#[derive(Debug)]
pub struct ModalBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    mode: BufferMode,
}

impl ModalBuffer {
    /// Create an empty buffer in input mode
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            mode: BufferMode::Input,
        }
    }

    /// Current mode
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes not yet drained
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Whether there are no pending bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space left at the write position
    pub fn free(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Switch to input mode, compacting unread bytes to the front
    pub fn set_input_mode(&mut self) {
        if self.mode == BufferMode::Output {
            if self.read_pos > 0 {
                self.data.copy_within(self.read_pos..self.write_pos, 0);
                self.write_pos -= self.read_pos;
                self.read_pos = 0;
            }
            self.mode = BufferMode::Input;
        }
    }

    /// Switch to output mode
    pub fn set_output_mode(&mut self) {
        self.mode = BufferMode::Output;
    }

    /// Append `src`. Caller guarantees input mode and enough free space.
    pub fn put(&mut self, src: &[u8]) {
        debug_assert_eq!(self.mode, BufferMode::Input);
        assert!(src.len() <= self.free(), "ModalBuffer::put overflow");
        self.data[self.write_pos..self.write_pos + src.len()].copy_from_slice(src);
        self.write_pos += src.len();
    }

    /// Append a single byte
    pub fn put_byte(&mut self, b: u8) {
        self.put(&[b]);
    }

    /// Pending bytes, in order
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Mark `amount` pending bytes as drained
    pub fn consume(&mut self, amount: usize) {
        debug_assert_eq!(self.mode, BufferMode::Output);
        assert!(amount <= self.len(), "ModalBuffer::consume past write position");
        self.read_pos += amount;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Drop all content and return to input mode
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.mode = BufferMode::Input;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compacts_on_input_switch() {
        let mut buf = ModalBuffer::with_capacity(8);
        buf.put(b"abcdef");
        assert_eq!(buf.free(), 2);

        buf.set_output_mode();
        buf.consume(4);
        assert_eq!(buf.unread(), b"ef");

        // Unread bytes move to the front
        buf.set_input_mode();
        assert_eq!(buf.free(), 6);
        buf.put(b"gh");
        assert_eq!(buf.unread(), b"efgh");
    }

    #[test]
    fn test_full_drain_resets_positions() {
        let mut buf = ModalBuffer::with_capacity(4);
        buf.put(b"wxyz");
        buf.set_output_mode();
        buf.consume(4);
        assert!(buf.is_empty());
        assert_eq!(buf.free(), 4);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_put_overflow_panics() {
        let mut buf = ModalBuffer::with_capacity(2);
        buf.put(b"abc");
    }
}
