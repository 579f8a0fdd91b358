//! Ordered queue of pending outbound chunks

use bytes::Bytes;
use std::collections::VecDeque;

/// Outbound data handed to [`Connection::write`](crate::connection::Connection::write).
///
/// The variant states who owns the bytes: owned data is queued as-is when it
/// cannot be sent immediately, borrowed data is copied first.
#[derive(Debug, Clone)]
pub enum Payload<'a> {
    /// Ownership transferred to the connection
    Owned(Bytes),
    /// Caller keeps ownership; a private copy is taken if queuing is needed
    Borrowed(&'a [u8]),
}

impl<'a> Payload<'a> {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the bytes
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(b) => b,
            Payload::Borrowed(s) => s,
        }
    }

    /// Convert the bytes from `from` onwards into a queueable chunk
    pub fn into_chunk(self, from: usize) -> Bytes {
        match self {
            Payload::Owned(b) => b.slice(from..),
            Payload::Borrowed(s) => Bytes::copy_from_slice(&s[from..]),
        }
    }
}

impl From<Vec<u8>> for Payload<'static> {
    fn from(v: Vec<u8>) -> Self {
        Payload::Owned(Bytes::from(v))
    }
}

impl From<String> for Payload<'static> {
    fn from(s: String) -> Self {
        Payload::Owned(Bytes::from(s))
    }
}

impl From<Bytes> for Payload<'static> {
    fn from(b: Bytes) -> Self {
        Payload::Owned(b)
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(s: &'a [u8]) -> Self {
        Payload::Borrowed(s)
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(s: &'a str) -> Self {
        Payload::Borrowed(s.as_bytes())
    }
}

/// FIFO of chunks waiting for the transport to accept them.
///
/// Only the head chunk is ever partially transmitted; `write_offset` says how
/// much of it already went out.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    write_offset: usize,
}

impl WriteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes still to be transmitted
    pub fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum::<usize>() - self.write_offset
    }

    /// Bytes of the head chunk already transmitted
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// Append a chunk at the tail
    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// Untransmitted part of the head chunk
    pub fn front(&self) -> Option<Bytes> {
        self.chunks
            .front()
            .map(|chunk| chunk.slice(self.write_offset..))
    }

    /// Record that `n` bytes of the head chunk went out.
    ///
    /// Returns `true` when the head chunk was completed and removed.
    pub fn advance(&mut self, n: usize) -> bool {
        let Some(head) = self.chunks.front() else {
            return false;
        };
        self.write_offset += n;
        debug_assert!(self.write_offset <= head.len());
        if self.write_offset >= head.len() {
            self.chunks.pop_front();
            self.write_offset = 0;
            true
        } else {
            false
        }
    }

    /// Discard everything without transmitting it
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.write_offset = 0;
    }
}
