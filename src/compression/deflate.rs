//! Raw DEFLATE compression at the fastest level.

use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::alloc::Allocator;
use crate::core::{CompressionError, DEFLATE_BLOCK_SIZE};

use super::Compressor;

/// Minimum growth while decompressing.
const MIN_EXPAND: usize = 256;

/// DEFLATE compressor without zlib or gzip framing.
#[derive(Debug, Clone)]
pub struct DeflateCompressor {
    allocator: Arc<Allocator>,
}

impl DeflateCompressor {
    /// Create a compressor that grows buffers through `allocator`.
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }
}

impl Compressor for DeflateCompressor {
    fn max_compressed_length(&self, len: usize) -> usize {
        len + 5 * (1 + len / DEFLATE_BLOCK_SIZE)
    }

    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let bound = self.max_compressed_length(input.len());
        if output.len() < bound {
            self.allocator.expand_message(output, 0, bound)?;
        }

        let mut stream = Compress::new(Compression::fast(), false);
        loop {
            let consumed = stream.total_in() as usize;
            let written = stream.total_out() as usize;
            if written == output.len() {
                self.allocator
                    .expand_message(output, written, MIN_EXPAND.max(input.len() / 4))?;
            }
            let status = stream
                .compress(&input[consumed..], &mut output[written..], FlushCompress::Finish)
                .map_err(|e| CompressionError::Deflate(e.to_string()))?;
            match status {
                Status::StreamEnd => return Ok(stream.total_out() as usize),
                Status::Ok | Status::BufError => {
                    if stream.total_out() as usize == written
                        && stream.total_in() as usize == consumed
                        && written < output.len()
                    {
                        return Err(CompressionError::Deflate("compressor stalled".into()));
                    }
                }
            }
        }
    }

    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let mut stream = Decompress::new(false);
        loop {
            let consumed = stream.total_in() as usize;
            let written = stream.total_out() as usize;
            if written == output.len() {
                // Grow towards the allocator limit, past it only to report the overflow
                let room = self.allocator.max_length().saturating_sub(written);
                let extra = MIN_EXPAND.max(input.len() * 2).min(room).max(1);
                self.allocator.expand_message(output, written, extra)?;
            }
            let status = stream
                .decompress(&input[consumed..], &mut output[written..], FlushDecompress::None)
                .map_err(|e| CompressionError::Deflate(e.to_string()))?;
            match status {
                Status::StreamEnd => return Ok(stream.total_out() as usize),
                Status::Ok | Status::BufError => {
                    // No progress with room left means the input ran out
                    if stream.total_out() as usize == written
                        && stream.total_in() as usize == consumed
                        && written < output.len()
                    {
                        return Err(CompressionError::Truncated);
                    }
                }
            }
        }
    }
}
