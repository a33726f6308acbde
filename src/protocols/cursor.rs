//! Bounds-checked reader over a fixed-layout byte slice.
//!
//! Fields are read one at a time; a read that would run past the end of the
//! slice returns `None` and leaves the cursor where it was, so callers map
//! `None` straight to [`Decode::Incomplete`](super::Decode::Incomplete).

use bytes::Buf;

#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    start: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            start: buf.len(),
        }
    }

    /// Bytes read so far.
    pub fn position(&self) -> usize {
        self.start - self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Everything not yet read.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.buf.remaining() < N {
            return None;
        }
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|[b]| b)
    }

    pub fn u16_be(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn u32_be(&mut self) -> Option<u32> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn u64_be(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }

    pub fn u16_ne(&mut self) -> Option<u16> {
        self.array().map(u16::from_ne_bytes)
    }

    pub fn u32_ne(&mut self) -> Option<u32> {
        self.array().map(u32::from_ne_bytes)
    }

    pub fn u64_ne(&mut self) -> Option<u64> {
        self.array().map(u64::from_ne_bytes)
    }

    /// Take the next `n` bytes without copying.
    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.bytes(n).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_mixed_order_fields() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0102u16.to_be_bytes());
        data.extend_from_slice(&7u32.to_ne_bytes());
        data.extend_from_slice(b"tail");

        let mut cur = Cursor::new(&data);
        assert_eq!(cur.u16_be(), Some(0x0102));
        assert_eq!(cur.u32_ne(), Some(7));
        assert_eq!(cur.position(), 6);
        assert_eq!(cur.rest(), b"tail");
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let data = [1u8, 2, 3];
        let mut cur = Cursor::new(&data);

        assert_eq!(cur.u32_be(), None);
        assert_eq!(cur.position(), 0);
        assert_eq!(cur.bytes(4), None);
        assert_eq!(cur.bytes(3), Some(&data[..]));
        assert_eq!(cur.u8(), None);
    }
}
