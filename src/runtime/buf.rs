//! Growable byte buffer used for all socket I/O.
//!
//! A `Buf` holds the readable region `start..end` of its storage. Reading
//! from the front advances `start`; appending or filling spare room advances
//! `end`. Storage is a `BytesMut`, so consumed prefixes are reclaimed on the
//! next growth and slices can be split off without copying.

use bytes::{Buf as _, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Default initial capacity
pub const BUF_INC: usize = 4096;

#[derive(Debug)]
pub struct Buf {
    data: BytesMut,
    max: usize,
    pending: usize,
}

impl Buf {
    /// Creates an unbounded buffer with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX)
    }

    /// Creates a buffer that refuses to grow past `max` bytes.
    pub fn with_limit(capacity: usize, max: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity.min(max)),
            max,
            pending: 0,
        }
    }

    /// Number of readable bytes (`end - start`)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn limit(&self) -> usize {
        self.max
    }

    /// Remaining bytes that may be appended before hitting the limit.
    pub fn room(&self) -> usize {
        self.max.saturating_sub(self.data.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Appends a block, growing the storage as needed.
    pub fn put_block(&mut self, block: &[u8]) -> Result<()> {
        if block.len() > self.room() {
            return Err(Error::Limit("buffer"));
        }
        self.data.extend_from_slice(block);
        Ok(())
    }

    pub fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_block(s.as_bytes())
    }

    /// Consumes `n` bytes from the front.
    pub fn adjust_start(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Returns up to `want` bytes of writable space after `end`.
    ///
    /// The space is zero-filled. Call [`Buf::adjust_end`] with the number of
    /// bytes actually written before any other operation on the buffer.
    pub fn spare(&mut self, want: usize) -> Result<&mut [u8]> {
        self.adjust_end(0);
        let want = want.min(self.room());
        if want == 0 {
            return Err(Error::Limit("buffer"));
        }
        let len = self.data.len();
        self.data.resize(len + want, 0);
        self.pending = want;
        Ok(&mut self.data[len..])
    }

    /// Commits `n` bytes written into the space returned by [`Buf::spare`].
    pub fn adjust_end(&mut self, n: usize) {
        let n = n.min(self.pending);
        let len = self.data.len() - self.pending + n;
        self.data.truncate(len);
        self.pending = 0;
    }

    /// Drops consumed space so future appends reuse it.
    pub fn compact(&mut self) {
        self.adjust_end(0);
        let mut fresh = BytesMut::with_capacity(self.data.len().max(BUF_INC).min(self.max));
        fresh.extend_from_slice(&self.data);
        self.data = fresh;
    }

    /// Splits off the first `n` readable bytes without copying.
    pub fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Position of `pattern` within the readable region.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() || pattern.len() > self.data.len() {
            return None;
        }
        self.data.windows(pattern.len()).position(|w| w == pattern)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for Buf {
    fn default() -> Self {
        Self::new(BUF_INC)
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
