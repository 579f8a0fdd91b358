//! Raw deflate stream compression (RFC 1951, no zlib framing)

use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

/// First output allocation per write; doubled while the codec keeps filling it
const DEFLATE_INITIAL_OUTPUT: usize = 32;

/// Paired inbound/outbound codec state of one connection
pub struct Compressor {
    deflate: Compress,
    inflate: Decompress,
    /// Compressed bytes read from the transport but not yet inflated
    inbound: BytesMut,
    /// Compressed bytes produced but not yet accepted by the transport
    residue: Bytes,
}

impl Compressor {
    /// Create both codecs with raw framing
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), false),
            inflate: Decompress::new(false),
            inbound: BytesMut::new(),
            residue: Bytes::new(),
        }
    }

    /// Compress `input` and sync-flush, returning everything the codec produced
    pub fn deflate(&mut self, input: &[u8]) -> Result<Bytes> {
        let mut out = Vec::with_capacity(DEFLATE_INITIAL_OUTPUT);
        let mut consumed = 0;

        loop {
            let before_in = self.deflate.total_in();
            let before_out = out.len();
            self.deflate
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("outbound: {}", e)))?;
            let progress = (self.deflate.total_in() - before_in) as usize;
            consumed += progress;

            if out.len() < out.capacity() && consumed == input.len() {
                break;
            }
            if progress == 0 && out.len() == before_out {
                return Err(Error::Compression("outbound: codec stalled".to_string()));
            }
            let grow = out.capacity();
            out.reserve(grow);
        }

        Ok(Bytes::from(out))
    }

    /// Queue compressed bytes read from the transport
    pub fn feed(&mut self, compressed: &[u8]) {
        self.inbound.extend_from_slice(compressed);
    }

    /// Whether compressed input is still waiting to be inflated
    pub fn has_pending_input(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Inflate queued input into `out`; returns the number of bytes produced.
    ///
    /// Input that does not fit stays queued for the next call.
    pub fn inflate_into(&mut self, out: &mut [u8]) -> Result<usize> {
        let before_in = self.inflate.total_in();
        let before_out = self.inflate.total_out();
        self.inflate
            .decompress(&self.inbound, out, FlushDecompress::None)
            .map_err(|e| Error::Compression(format!("inbound: {}", e)))?;
        let consumed = (self.inflate.total_in() - before_in) as usize;
        self.inbound.advance(consumed);
        Ok((self.inflate.total_out() - before_out) as usize)
    }

    /// Whether compressed output is waiting for the transport
    pub fn has_residue(&self) -> bool {
        !self.residue.is_empty()
    }

    /// Length of the untransmitted compressed output
    pub fn residue_len(&self) -> usize {
        self.residue.len()
    }

    /// Take the untransmitted compressed output
    pub fn take_residue(&mut self) -> Bytes {
        std::mem::take(&mut self.residue)
    }

    /// Keep compressed output the transport did not accept
    pub fn set_residue(&mut self, residue: Bytes) {
        self.residue = residue;
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("total_in", &self.deflate.total_in())
            .field("total_out", &self.inflate.total_out())
            .field("inbound", &self.inbound.len())
            .field("residue", &self.residue.len())
            .finish()
    }
}
