//! Bounded byte channel between the responder and the program engine
//!
//! The USB side pushes DNLOAD payload bytes in, the flash side pulls page
//! sized slices out. Order is preserved and nothing is ever dropped: a push
//! that does not fit accepts only a prefix and reports how much it took.

use heapless::spsc::Queue;

/// Ordered byte FIFO with room for `N - 1` bytes
pub struct ByteChannel<const N: usize> {
    queue: Queue<u8, N>,
}

impl<const N: usize> Default for ByteChannel<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ByteChannel<N> {
    /// Create an empty channel
    pub const fn new() -> Self {
        Self { queue: Queue::new() }
    }

    /// Maximum number of bytes held at once
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of bytes waiting
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no bytes are waiting
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Room left before pushes start being refused
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Push as much of `data` as fits, returning the number of bytes taken
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let mut taken = 0;
        for &b in data {
            if self.queue.enqueue(b).is_err() {
                break;
            }
            taken += 1;
        }
        taken
    }

    /// Pop exactly `buf.len()` bytes, or nothing if fewer are waiting
    pub fn pop_into(&mut self, buf: &mut [u8]) -> bool {
        if self.len() < buf.len() {
            return false;
        }
        for slot in buf.iter_mut() {
            match self.queue.dequeue() {
                Some(b) => *slot = b,
                None => return false,
            }
        }
        true
    }

    /// Drop everything waiting
    pub fn clear(&mut self) {
        while self.queue.dequeue().is_some() {}
    }
}
