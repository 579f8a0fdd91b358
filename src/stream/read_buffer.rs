//! Fixed-capacity receive window with line extraction

use crate::{Error, Result};

/// Physical capacity of every connection's receive buffer
pub const READ_BUFFER_SIZE: usize = 100_000;

/// Receive window over a fixed byte array.
///
/// Unconsumed data lives in `data[offset..offset + bytes]`. `scanoff` records how
/// far line scanning already got inside that window so repeated partial reads do
/// not rescan old bytes.
pub struct ReadBuffer {
    data: Box<[u8]>,
    offset: usize,
    bytes: usize,
    scanoff: usize,
}

impl ReadBuffer {
    /// Create a buffer of [`READ_BUFFER_SIZE`] bytes
    pub fn new() -> Self {
        Self::with_capacity(READ_BUFFER_SIZE)
    }

    /// Create a buffer with a custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
            bytes: 0,
            scanoff: 0,
        }
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unconsumed bytes
    pub fn len(&self) -> usize {
        self.bytes
    }

    /// Whether no unconsumed bytes remain
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Start of the unconsumed window
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Line-scan progress within the unconsumed window
    pub fn scanoff(&self) -> usize {
        self.scanoff
    }

    /// Unconsumed bytes
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.bytes]
    }

    /// Free space following the unconsumed window, for the next fill.
    ///
    /// When the window has reached the physical end but there is room in front
    /// of it, the window is moved to the start first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferFull`] when the whole buffer is unconsumed data.
    pub fn spare_mut(&mut self) -> Result<&mut [u8]> {
        if self.offset + self.bytes == self.data.len() {
            if self.offset == 0 {
                return Err(Error::BufferFull);
            }
            self.compact();
        }
        let end = self.offset + self.bytes;
        Ok(&mut self.data[end..])
    }

    /// Mark `n` bytes written into [`spare_mut`](Self::spare_mut) as available
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.offset + self.bytes + n <= self.data.len());
        self.bytes += n;
    }

    /// Append bytes directly (used by tests and decoders)
    pub fn extend_from_slice(&mut self, src: &[u8]) -> Result<()> {
        let spare = self.spare_mut()?;
        if spare.len() < src.len() {
            return Err(Error::BufferFull);
        }
        spare[..src.len()].copy_from_slice(src);
        self.commit(src.len());
        Ok(())
    }

    /// Copy up to `buf.len()` unconsumed bytes out and consume them
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.bytes.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
        self.bytes -= n;
        if self.bytes == 0 {
            self.offset = 0;
        } else {
            self.offset += n;
        }
        // scanoff is relative to offset
        self.scanoff = self.scanoff.saturating_sub(n);
        n
    }

    /// Extract the next complete line.
    ///
    /// The returned slice excludes the `\n` terminator and a `\r` right before it.
    /// Returns `None` when no terminator has arrived yet; scanning resumes where
    /// it stopped on the next call.
    pub fn read_line(&mut self) -> Option<&[u8]> {
        let start = self.offset;
        let window = &self.data[start + self.scanoff..start + self.bytes];
        let Some(pos) = window.iter().position(|&b| b == b'\n') else {
            self.scanoff = self.bytes;
            if start + self.bytes == self.data.len() {
                self.compact();
            }
            return None;
        };

        let newline = start + self.scanoff + pos;
        let consumed = newline + 1 - start;
        self.bytes -= consumed;
        self.scanoff = 0;
        if self.bytes == 0 {
            self.offset = 0;
        } else {
            self.offset += consumed;
        }

        let mut end = newline;
        if end > start && self.data[end - 1] == b'\r' {
            end -= 1;
        }
        Some(&self.data[start..end])
    }

    /// Drop all unconsumed data
    pub fn clear(&mut self) {
        self.offset = 0;
        self.bytes = 0;
        self.scanoff = 0;
    }

    fn compact(&mut self) {
        self.data
            .copy_within(self.offset..self.offset + self.bytes, 0);
        self.offset = 0;
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("capacity", &self.data.len())
            .field("offset", &self.offset)
            .field("bytes", &self.bytes)
            .field("scanoff", &self.scanoff)
            .finish()
    }
}
