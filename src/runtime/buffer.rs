//! Fixed-capacity byte buffers.
//!
//! A `ScratchBuffer` is allocated once at its full capacity and reused for
//! the lifetime of its owner. Readers fill the spare tail, consumers advance
//! the head, and the live region is moved back to the front only when the
//! tail runs out. Capacity is a hard limit: nothing here grows.

use std::io::{self, Read};

/// Error returned when data does not fit a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub needed: usize,
    pub capacity: usize,
}

impl std::fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} bytes do not fit buffer of {} bytes",
            self.needed, self.capacity
        )
    }
}

impl std::error::Error for CapacityExceeded {}

/// Reusable byte buffer with a fixed capacity.
#[derive(Debug)]
pub struct ScratchBuffer {
    buf: Box<[u8]>,
    /// Start of unconsumed data.
    head: usize,
    /// End of valid data.
    tail: usize,
}

impl ScratchBuffer {
    /// Allocate a buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "scratch buffer capacity must be non-zero");
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Room left once the live region is compacted.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len()
    }

    /// The unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.tail]
    }

    /// Drop `n` bytes from the front.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`len`](Self::len).
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past end of buffer");
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Consume `n` bytes from the front and return them.
    ///
    /// The returned view stays valid until the buffer is next written.
    ///
    /// # Panics
    /// Panics if `n` exceeds [`len`](Self::len).
    pub fn split_front(&mut self, n: usize) -> &[u8] {
        let start = self.head;
        self.consume(n);
        &self.buf[start..start + n]
    }

    /// Forget all data.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Move live data to the front so the whole remainder is writable.
    pub fn compact(&mut self) {
        if self.head > 0 {
            self.buf.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }

    /// Writable tail, compacting first if it is exhausted.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.tail == self.capacity() {
            self.compact();
        }
        &mut self.buf[self.tail..]
    }

    /// Mark `n` bytes of the spare tail as written.
    ///
    /// # Panics
    /// Panics if `n` exceeds the spare tail.
    pub fn commit(&mut self, n: usize) {
        assert!(self.tail + n <= self.capacity(), "commit past capacity");
        self.tail += n;
    }

    /// Append `data`, failing without side effects if it does not fit.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), CapacityExceeded> {
        let needed = self.len() + data.len();
        if needed > self.capacity() {
            return Err(CapacityExceeded {
                needed,
                capacity: self.capacity(),
            });
        }
        if self.capacity() - self.tail < data.len() {
            self.compact();
        }
        self.buf[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
        Ok(())
    }

    /// Read once from `reader` into the spare tail.
    ///
    /// Returns `Ok(0)` both on EOF and when the buffer is full; callers tell
    /// the two apart with [`is_full`](Self::is_full).
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.is_full() {
            return Ok(0);
        }
        let n = reader.read(self.spare_mut())?;
        self.commit(n);
        Ok(n)
    }

    /// Iterate over the data in pieces of at most `chunk_size` bytes.
    pub fn chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, u8> {
        self.data().chunks(chunk_size.max(1))
    }
}
