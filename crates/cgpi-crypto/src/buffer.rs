//! Growable byte buffer with a read cursor.
//!
//! Consumed bytes are only reclaimed once they make up at least half of the
//! allocation, so trimming the front does not reallocate on every call.

#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: Vec<u8>,
    start: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.compact();
        self.data.extend_from_slice(bytes);
    }

    /// Unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that may be released while keeping the last `reserve` back.
    pub fn releasable(&self, reserve: usize) -> usize {
        self.len().saturating_sub(reserve)
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past end of buffer");
        self.start += n;
        if self.start == self.data.len() {
            self.data.clear();
            self.start = 0;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    fn compact(&mut self) {
        if self.start > 0 && self.start * 2 >= self.data.len() {
            self.data.drain(..self.start);
            self.start = 0;
        }
    }
}
