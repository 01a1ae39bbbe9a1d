//! Owned I/O buffers
//!
//! A [`Buffer`] is the unit of data handed between the read pipeline and the
//! write queues. It is never cloned: it is either being filled by a source,
//! queued for a destination, or dropped.

/// Default buffer capacity in bytes
pub const DEFAULT_CAPACITY: usize = 64;

/// Fixed-capacity byte region holding unsent data
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    /// Bytes already consumed from the front by completed writes
    start: usize,
    /// Bytes still valid after `start`
    len: usize,
}

impl Buffer {
    /// Create an empty buffer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    /// Create a buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            start: 0,
            len: bytes.len(),
        }
    }

    #[cfg(any(windows, test))]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unsent bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bytes not yet written
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    /// The whole region, for a source to read into.
    ///
    /// Resets the cursor: a buffer being filled holds no unsent data.
    pub fn fill_area(&mut self) -> &mut [u8] {
        self.start = 0;
        self.len = 0;
        &mut self.data
    }

    /// Record how many bytes a read placed in [`fill_area`](Self::fill_area)
    pub fn set_filled(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.start = 0;
        self.len = n.min(self.data.len());
    }

    /// Mark `n` bytes at the front as written
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len, "advance past end: {} > {}", n, self.len);
        let n = n.min(self.len);
        self.start += n;
        self.len -= n;
    }

    /// Drop everything past the first `n` unsent bytes
    pub fn truncate(&mut self, n: usize) {
        self.len = self.len.min(n);
    }

    /// True once every byte has been written
    pub fn is_consumed(&self) -> bool {
        self.len == 0
    }
}
