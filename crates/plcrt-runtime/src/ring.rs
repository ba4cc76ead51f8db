//! Byte ring buffer backing the trace sample store.
//!
//! Claim-based API: writers reserve a contiguous region at the write
//! cursor (`put_claim`/`put_finish`), readers borrow a contiguous
//! region at the read cursor (`get_claim`/`get_finish`). A claim never
//! spans the physical end of the buffer; the trace engine handles
//! wraparound by committing a zero-filled short region and discarding
//! it from the read side.

use std::fmt;

/// Fixed-capacity circular byte store.
pub struct RingBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    len: usize,
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.data.len())
            .field("len", &self.len)
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

impl RingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read: 0,
            write: 0,
            len: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.data.len() - self.len
    }

    /// Drop all stored bytes and rewind both cursors.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
    }

    /// Reserve a contiguous writable region of at most `want` bytes.
    ///
    /// The returned slice may be shorter than `want` when the free
    /// space or the run up to the physical end of the buffer is
    /// smaller.
    pub fn put_claim(&mut self, want: usize) -> &mut [u8] {
        let contiguous = want.min(self.free()).min(self.data.len() - self.write);
        let start = self.write;
        &mut self.data[start..start + contiguous]
    }

    /// Commit `count` bytes of the last `put_claim`.
    pub fn put_finish(&mut self, count: usize) {
        debug_assert!(count <= self.free());
        debug_assert!(count <= self.data.len() - self.write);
        self.write = (self.write + count) % self.data.len();
        self.len += count;
    }

    /// Borrow a contiguous readable region of at most `want` bytes.
    #[must_use]
    pub fn get_claim(&self, want: usize) -> &[u8] {
        let contiguous = want.min(self.len).min(self.data.len() - self.read);
        &self.data[self.read..self.read + contiguous]
    }

    /// Consume `count` bytes of the last `get_claim`.
    pub fn get_finish(&mut self, count: usize) {
        debug_assert!(count <= self.len);
        debug_assert!(count <= self.data.len() - self.read);
        self.read = (self.read + count) % self.data.len();
        self.len -= count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(ring: &mut RingBuffer, bytes: &[u8]) -> bool {
        let claim = ring.put_claim(bytes.len());
        if claim.len() < bytes.len() {
            return false;
        }
        claim.copy_from_slice(bytes);
        ring.put_finish(bytes.len());
        true
    }

    #[test]
    fn put_then_get_preserves_bytes() {
        let mut ring = RingBuffer::new(16);
        assert!(put(&mut ring, b"abcd"));
        assert!(put(&mut ring, b"efgh"));
        assert_eq!(ring.free(), 8);
        assert_eq!(ring.get_claim(4), b"abcd");
        ring.get_finish(4);
        assert_eq!(ring.get_claim(4), b"efgh");
        ring.get_finish(4);
        assert!(ring.is_empty());
    }

    #[test]
    fn claim_stops_at_physical_end() {
        let mut ring = RingBuffer::new(8);
        assert!(put(&mut ring, b"abcdef"));
        ring.get_finish(6);
        // Write cursor at 6: only 2 contiguous bytes remain before wrap.
        assert_eq!(ring.put_claim(4).len(), 2);
    }

    #[test]
    fn short_commit_is_consumable_as_padding() {
        let mut ring = RingBuffer::new(8);
        assert!(put(&mut ring, b"abcdef"));
        ring.get_finish(6);
        let claim = ring.put_claim(4);
        let short = claim.len();
        claim.fill(0);
        ring.put_finish(short);
        ring.get_finish(short);
        // Both cursors are back at buffer start.
        assert!(put(&mut ring, b"wxyz"));
        assert_eq!(ring.get_claim(4), b"wxyz");
    }

    #[test]
    fn reads_resume_at_buffer_start_after_wrap() {
        let mut ring = RingBuffer::new(8);
        assert!(put(&mut ring, b"abcdef"));
        ring.get_finish(4);
        assert!(put(&mut ring, b"gh"));
        assert!(put(&mut ring, b"ij"));
        // The contiguous readable run stops at the physical end.
        assert_eq!(ring.get_claim(8), b"efgh");
        ring.get_finish(4);
        assert_eq!(ring.get_claim(8), b"ij");
        ring.get_finish(2);
        assert!(ring.is_empty());
    }

    #[test]
    fn free_tracks_commits() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.free(), 8);
        assert!(put(&mut ring, b"abc"));
        assert_eq!(ring.free(), 5);
        ring.reset();
        assert_eq!(ring.free(), 8);
    }
}
