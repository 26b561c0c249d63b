//! Deflate stream stages for compressed links.
//!
//! Both directions use a zlib stream with a sync flush after every chunk, so
//! the remote can decode each message as soon as it arrives without waiting
//! for more data.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{OverlayError, Result};

const OUTPUT_SLACK: usize = 64;

/// Plain bytes produced per inflate step.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Egress compression stage.
pub struct TxDeflater {
    stream: Compress,
    given: u64,
    deflated: u64,
}

impl TxDeflater {
    pub fn new(level: u32) -> Self {
        Self {
            stream: Compress::new(Compression::new(level.min(9)), true),
            given: 0,
            deflated: 0,
        }
    }

    /// Compresses `input` and sync-flushes, appending to `out`.
    pub fn deflate(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let start_in = self.stream.total_in();
        let start_out = out.len();
        loop {
            let consumed = (self.stream.total_in() - start_in) as usize;
            if out.capacity() - out.len() < OUTPUT_SLACK {
                out.reserve(input.len().max(256));
            }
            let before = (self.stream.total_in(), self.stream.total_out());
            self.stream
                .compress_vec(&input[consumed..], out, FlushCompress::Sync)
                .map_err(|e| OverlayError::Compression(e.to_string()))?;
            let consumed = (self.stream.total_in() - start_in) as usize;
            let stalled = before == (self.stream.total_in(), self.stream.total_out());
            if consumed == input.len() && (out.len() < out.capacity() || stalled) {
                break;
            }
            if stalled {
                return Err(OverlayError::Compression("deflate made no progress".into()));
            }
        }
        let produced = out.len() - start_out;
        self.given += input.len() as u64;
        self.deflated += produced as u64;
        Ok(produced)
    }

    /// Bytes handed to the stage.
    pub fn given(&self) -> u64 {
        self.given
    }

    /// Bytes the stage produced.
    pub fn deflated(&self) -> u64 {
        self.deflated
    }
}

/// Ingress decompression stage.
pub struct RxInflater {
    stream: Decompress,
    given: u64,
    inflated: u64,
}

impl Default for RxInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl RxInflater {
    pub fn new() -> Self {
        Self {
            stream: Decompress::new(true),
            given: 0,
            inflated: 0,
        }
    }

    /// Inflates `input`, appending the plain bytes to `out`.
    pub fn inflate(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        self.inflate_bounded(input, out, usize::MAX).map(|(_, produced)| produced)
    }

    /// Inflates at most `max_out` plain bytes from `input`.
    ///
    /// Returns the number of input bytes consumed and plain bytes produced.
    /// When `produced == max_out` the caller must call again with the rest of
    /// the input, even if none is left, to collect what the stream still holds.
    pub fn inflate_bounded(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        max_out: usize,
    ) -> Result<(usize, usize)> {
        let start_in = self.stream.total_in();
        let mut produced = 0;
        let mut chunk = [0u8; INFLATE_CHUNK];
        loop {
            let room = max_out - produced;
            if room == 0 {
                break;
            }
            let window = chunk.len().min(room);
            let consumed = (self.stream.total_in() - start_in) as usize;
            let before = (self.stream.total_in(), self.stream.total_out());
            let status = self
                .stream
                .decompress(&input[consumed..], &mut chunk[..window], FlushDecompress::Sync)
                .map_err(|e| OverlayError::Compression(e.to_string()))?;
            let written = (self.stream.total_out() - before.1) as usize;
            out.extend_from_slice(&chunk[..written]);
            produced += written;
            if status == Status::StreamEnd {
                return Err(OverlayError::Compression("peer ended the deflate stream".into()));
            }
            let consumed = (self.stream.total_in() - start_in) as usize;
            if consumed == input.len() && written < window {
                break;
            }
            if before == (self.stream.total_in(), self.stream.total_out()) {
                return Err(OverlayError::Compression("inflate made no progress".into()));
            }
        }
        let consumed = (self.stream.total_in() - start_in) as usize;
        self.given += consumed as u64;
        self.inflated += produced as u64;
        Ok((consumed, produced))
    }

    /// Compressed bytes received.
    pub fn given(&self) -> u64 {
        self.given
    }

    /// Plain bytes produced.
    pub fn inflated(&self) -> u64 {
        self.inflated
    }
}

/// Fraction of bytes saved by compression, 0.0 when nothing went through.
pub fn compression_ratio(plain: u64, compressed: u64) -> f64 {
    if plain == 0 {
        return 0.0;
    }
    (plain as f64 - compressed as f64) / plain as f64
}
