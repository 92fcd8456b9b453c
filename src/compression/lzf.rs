//! LZF compression.
//!
//! Stream format, one control byte at a time:
//! - `ctrl < 32`: literal run of `ctrl + 1` bytes follows
//! - otherwise a back reference: `len = ctrl >> 5` (7 means one more length
//!   byte follows), `offset = ((ctrl & 0x1f) << 8) + next + 1`, copying
//!   `len + 2` bytes from `offset` bytes behind the output cursor

use std::sync::Arc;

use crate::alloc::Allocator;
use crate::core::{CompressionError, LZF_HLOG, LZF_HSIZE, LZF_MAX_LIT, LZF_MAX_OFF, LZF_MAX_REF};

use super::Compressor;

/// LZF compressor with pooled hash tables.
#[derive(Debug, Clone)]
pub struct LzfCompressor {
    allocator: Arc<Allocator>,
}

impl LzfCompressor {
    /// Create a compressor that borrows buffers from `allocator`.
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }

    /// Make room for `extra` more bytes at `op`.
    fn reserve(&self, output: &mut Vec<u8>, op: usize, extra: usize) -> Result<(), CompressionError> {
        if op + extra > output.len() {
            self.allocator.expand_message(output, op, extra)?;
        }
        Ok(())
    }

    fn compress_with(
        &self,
        input: &[u8],
        output: &mut Vec<u8>,
        table: &mut [u32],
    ) -> Result<usize, CompressionError> {
        let len = input.len();
        if len == 0 {
            return Ok(0);
        }
        self.reserve(output, 0, self.max_compressed_length(len))?;

        let mut ip = 0usize;
        let mut lit = 0usize;
        // Reserve the control byte of the first literal run
        let mut op = 1usize;

        if len > 2 {
            let mut hval = first(input, ip);
            while ip + 2 < len {
                hval = next(hval, input, ip);
                let slot = index(hval);
                let reference = table[slot] as usize;
                table[slot] = ip as u32;

                // Position 0 doubles as the empty marker
                let matched = reference > 0
                    && reference < ip
                    && ip - reference - 1 < LZF_MAX_OFF
                    && input[reference..reference + 3] == input[ip..ip + 3];

                if matched {
                    let off = ip - reference - 1;
                    let maxlen = (len - ip - 2).min(LZF_MAX_REF);

                    self.reserve(output, op, 4)?;
                    // Close the literal run, dropping it if empty
                    output[op - lit - 1] = (lit as u8).wrapping_sub(1);
                    if lit == 0 {
                        op -= 1;
                    }

                    let mut mlen = 2;
                    loop {
                        mlen += 1;
                        if mlen >= maxlen || input[reference + mlen] != input[ip + mlen] {
                            break;
                        }
                    }
                    let encoded = mlen - 2;
                    ip += 1;

                    if encoded < 7 {
                        output[op] = ((off >> 8) + (encoded << 5)) as u8;
                        op += 1;
                    } else {
                        output[op] = ((off >> 8) + (7 << 5)) as u8;
                        output[op + 1] = (encoded - 7) as u8;
                        op += 2;
                    }
                    output[op] = off as u8;
                    op += 1;

                    // Start a new literal run
                    lit = 0;
                    op += 1;

                    ip += encoded + 1;
                    if ip + 2 >= len {
                        break;
                    }

                    // Rehash the last two positions of the match
                    ip -= 2;
                    hval = first(input, ip);
                    hval = next(hval, input, ip);
                    table[index(hval)] = ip as u32;
                    ip += 1;
                    hval = next(hval, input, ip);
                    table[index(hval)] = ip as u32;
                    ip += 1;
                } else {
                    self.reserve(output, op, 2)?;
                    output[op] = input[ip];
                    op += 1;
                    ip += 1;
                    lit += 1;
                    if lit == LZF_MAX_LIT {
                        output[op - lit - 1] = (lit - 1) as u8;
                        lit = 0;
                        op += 1;
                    }
                }
            }
        }

        while ip < len {
            self.reserve(output, op, 2)?;
            output[op] = input[ip];
            op += 1;
            ip += 1;
            lit += 1;
            if lit == LZF_MAX_LIT {
                output[op - lit - 1] = (lit - 1) as u8;
                lit = 0;
                op += 1;
            }
        }

        output[op - lit - 1] = (lit as u8).wrapping_sub(1);
        if lit == 0 {
            op -= 1;
        }
        Ok(op)
    }
}

#[inline]
fn first(data: &[u8], p: usize) -> u32 {
    (u32::from(data[p]) << 8) | u32::from(data[p + 1])
}

#[inline]
fn next(hval: u32, data: &[u8], p: usize) -> u32 {
    (hval << 8) | u32::from(data[p + 2])
}

#[inline]
fn index(hval: u32) -> usize {
    ((hval >> (3 * 8 - LZF_HLOG)).wrapping_sub(hval.wrapping_mul(5)) as usize) & (LZF_HSIZE - 1)
}

impl Compressor for LzfCompressor {
    fn max_compressed_length(&self, len: usize) -> usize {
        ((len * 33) >> 5) + 1
    }

    fn compress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let mut table = self.allocator.create_hash_table();
        let result = self.compress_with(input, output, &mut table);
        self.allocator.return_hash_table(table);
        result
    }

    fn decompress(&self, input: &[u8], output: &mut Vec<u8>) -> Result<usize, CompressionError> {
        let mut ip = 0usize;
        let mut op = 0usize;

        while ip < input.len() {
            let ctrl = usize::from(input[ip]);
            ip += 1;

            if ctrl < 32 {
                let run = ctrl + 1;
                if ip + run > input.len() {
                    return Err(CompressionError::Truncated);
                }
                self.reserve(output, op, run)?;
                output[op..op + run].copy_from_slice(&input[ip..ip + run]);
                ip += run;
                op += run;
                continue;
            }

            let mut len = ctrl >> 5;
            if len == 7 {
                let extra = *input.get(ip).ok_or(CompressionError::Truncated)?;
                len += usize::from(extra);
                ip += 1;
            }
            let low = *input.get(ip).ok_or(CompressionError::Truncated)?;
            ip += 1;

            let back = ((ctrl & 0x1f) << 8) + usize::from(low) + 1;
            if back > op {
                return Err(CompressionError::InvalidData(ip - 1));
            }
            let count = len + 2;
            self.reserve(output, op, count)?;
            let start = op - back;
            // Byte-wise so overlapping references repeat
            for i in 0..count {
                output[op + i] = output[start + i];
            }
            op += count;
        }

        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocatorLimits;

    fn lzf() -> LzfCompressor {
        LzfCompressor::new(Arc::new(Allocator::default()))
    }

    #[test]
    fn test_literal_only() {
        let compressor = lzf();
        let mut out = Vec::new();
        let len = compressor.compress(b"ab", &mut out).unwrap();
        assert_eq!(&out[..len], &[1, b'a', b'b']);
    }

    #[test]
    fn test_known_stream_decodes() {
        // literal "abc", then a back reference of 6 bytes at offset 3
        let stream = [2, b'a', b'b', b'c', (4 << 5), 2];
        let mut out = Vec::new();
        let len = lzf().decompress(&stream, &mut out).unwrap();
        assert_eq!(&out[..len], b"abcabcabc");
    }

    #[test]
    fn test_repetitive_shrinks() {
        let compressor = lzf();
        let data = vec![b'x'; 1000];
        let mut out = Vec::new();
        let len = compressor.compress(&data, &mut out).unwrap();
        assert!(len < 40, "compressed to {len}");

        let mut back = Vec::new();
        let n = compressor.decompress(&out[..len], &mut back).unwrap();
        assert_eq!(&back[..n], &data[..]);
    }

    #[test]
    fn test_bad_back_reference() {
        // back reference before any output
        let mut out = Vec::new();
        assert!(matches!(
            lzf().decompress(&[0x20, 0x00], &mut out),
            Err(CompressionError::InvalidData(_))
        ));
    }

    #[test]
    fn test_truncated_literal() {
        let mut out = Vec::new();
        assert!(matches!(
            lzf().decompress(&[5, 1, 2], &mut out),
            Err(CompressionError::Truncated)
        ));
        assert!(matches!(
            lzf().decompress(&[2, 1, 2, 3, 0xE0], &mut out),
            Err(CompressionError::Truncated)
        ));
    }

    #[test]
    fn test_decompress_respects_max_length() {
        let allocator = Arc::new(Allocator::new(AllocatorLimits {
            count: 4,
            pooled_length: 64,
            pooled_expand_length: 16,
            expand_length: 64,
            max_length: 100,
        }));
        let compressor = LzfCompressor::new(Arc::clone(&allocator));
        let mut compressed = Vec::new();
        let unbounded = LzfCompressor::new(Arc::new(Allocator::default()));
        let len = unbounded.compress(&[7u8; 500], &mut compressed).unwrap();

        let mut out = Vec::new();
        assert!(matches!(
            compressor.decompress(&compressed[..len], &mut out),
            Err(CompressionError::SizeExceeded { limit: 100, .. })
        ));
    }
}
