//! Packet body compression.
//!
//! Two algorithms are available, both borrowing their buffers from the
//! host [`Allocator`]: [`LzfCompressor`] and [`DeflateCompressor`].
//!
//! The compressors themselves always compress. Whether the compressed form
//! is used is decided by [`compress_if_smaller`]: a body is only sent
//! compressed when that makes it strictly smaller.

mod deflate;
mod lzf;

pub use deflate::DeflateCompressor;
pub use lzf::LzfCompressor;

use std::sync::Arc;

use crate::alloc::Allocator;
use crate::core::{CompressionError, CompressorKind};

/// A compression algorithm.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    /// Upper bound of the compressed length of `len` input bytes.
    fn max_compressed_length(&self, len: usize) -> usize;

    /// Compress `input` into `output`, growing it as needed. Returns the
    /// compressed length.
    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError>;

    /// Decompress `input` into `output`, growing it as needed up to the
    /// allocator's maximum length. Returns the decompressed length.
    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError>;
}

/// Create the compressor selected by `kind`.
pub fn create_compressor(kind: CompressorKind, allocator: Arc<Allocator>) -> Arc<dyn Compressor> {
    match kind {
        CompressorKind::Deflate => Arc::new(DeflateCompressor::new(allocator)),
        CompressorKind::Lzf => Arc::new(LzfCompressor::new(allocator)),
    }
}

/// Outcome of [`compress_if_smaller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressResult {
    /// `output[..len]` holds the compressed body.
    Compressed(usize),
    /// Compression did not help; send the input unchanged.
    Uncompressed,
}

impl CompressResult {
    /// Check if data was compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, CompressResult::Compressed(_))
    }
}

/// Compress `input` into `output` and keep the result only if it is
/// strictly smaller than the input.
///
/// A compressor failure is treated like an unhelpful compression: the body
/// is sent raw.
pub fn compress_if_smaller(
    compressor: &dyn Compressor,
    input: &[u8],
    output: &mut Vec<u8>,
) -> CompressResult {
    if input.is_empty() {
        return CompressResult::Uncompressed;
    }
    match compressor.compress(input, output) {
        Ok(len) if len < input.len() => CompressResult::Compressed(len),
        Ok(_) => CompressResult::Uncompressed,
        Err(err) => {
            tracing::debug!(%err, len = input.len(), "compression failed, sending raw");
            CompressResult::Uncompressed
        }
    }
}

/// Statistics for compression decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// Total bytes before compression
    pub total_uncompressed: u64,
    /// Total bytes after the compression decision
    pub total_compressed: u64,
    /// Number of bodies sent compressed
    pub compressed_count: u64,
    /// Number of bodies sent raw
    pub skipped_count: u64,
}

impl CompressionStats {
    /// Get compression ratio (compressed / uncompressed)
    pub fn ratio(&self) -> f64 {
        if self.total_uncompressed == 0 {
            1.0
        } else {
            self.total_compressed as f64 / self.total_uncompressed as f64
        }
    }

    /// Get bytes saved
    pub fn bytes_saved(&self) -> u64 {
        self.total_uncompressed.saturating_sub(self.total_compressed)
    }

    /// Record a compression decision
    pub fn record(&mut self, original_size: usize, result: CompressResult) {
        self.total_uncompressed += original_size as u64;
        match result {
            CompressResult::Compressed(len) => {
                self.total_compressed += len as u64;
                self.compressed_count += 1;
            }
            CompressResult::Uncompressed => {
                self.total_compressed += original_size as u64;
                self.skipped_count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn compressor(kind: CompressorKind) -> Arc<dyn Compressor> {
        create_compressor(kind, Arc::new(Allocator::default()))
    }

    fn sample(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(len)
            .copied()
            .collect()
    }

    #[rstest]
    #[case::deflate(CompressorKind::Deflate)]
    #[case::lzf(CompressorKind::Lzf)]
    fn test_roundtrip(#[case] kind: CompressorKind) {
        let compressor = compressor(kind);
        for len in [1, 2, 3, 31, 32, 33, 100, 4000, 70_000] {
            let data = sample(len);
            let mut compressed = Vec::new();
            let clen = compressor.compress(&data, &mut compressed).unwrap();
            assert!(clen <= compressor.max_compressed_length(len) || len < 4);

            let mut decompressed = Vec::new();
            let dlen = compressor
                .decompress(&compressed[..clen], &mut decompressed)
                .unwrap();
            assert_eq!(&decompressed[..dlen], &data[..], "length {len}");
        }
    }

    #[rstest]
    #[case::deflate(CompressorKind::Deflate)]
    #[case::lzf(CompressorKind::Lzf)]
    fn test_random_roundtrip(#[case] kind: CompressorKind) {
        use rand::{rngs::StdRng, RngCore, SeedableRng};
        let compressor = compressor(kind);
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = vec![0u8; 5000];
        rng.fill_bytes(&mut data);

        let mut compressed = Vec::new();
        let clen = compressor.compress(&data, &mut compressed).unwrap();
        let mut decompressed = Vec::new();
        let dlen = compressor
            .decompress(&compressed[..clen], &mut decompressed)
            .unwrap();
        assert_eq!(&decompressed[..dlen], &data[..]);
    }

    #[rstest]
    #[case::deflate(CompressorKind::Deflate)]
    #[case::lzf(CompressorKind::Lzf)]
    fn test_compress_if_smaller(#[case] kind: CompressorKind) {
        let compressor = compressor(kind);
        let mut output = Vec::new();

        let result = compress_if_smaller(compressor.as_ref(), &sample(1000), &mut output);
        assert!(result.is_compressed());

        let result = compress_if_smaller(compressor.as_ref(), b"ab", &mut output);
        assert_eq!(result, CompressResult::Uncompressed);
    }

    #[test]
    fn test_compression_stats() {
        let mut stats = CompressionStats::default();
        stats.record(1000, CompressResult::Compressed(100));
        stats.record(10, CompressResult::Uncompressed);

        assert_eq!(stats.total_uncompressed, 1010);
        assert_eq!(stats.total_compressed, 110);
        assert_eq!(stats.compressed_count, 1);
        assert_eq!(stats.skipped_count, 1);
        assert_eq!(stats.bytes_saved(), 900);
        assert!(stats.ratio() < 0.2);
    }
}
