//! Pooled buffer allocator.
//!
//! Every host owns one [`Allocator`]. Peers, the crypto session and the
//! compressors borrow their scratch buffers from it so the steady state of a
//! connection performs no per-packet allocation.
//!
//! Buffers are plain `Vec`s. Returning one moves it back into its pool, so a
//! returned buffer cannot be used again by the caller.

mod pool;

pub use pool::ArrayPool;

use thiserror::Error;
use tracing::warn;
use zeroize::Zeroize;

use crate::core::{CompressionError, HostConfig, LZF_HSIZE};

/// A buffer grew past the allocator's maximum length.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("buffer length {size} exceeds limit {limit}")]
pub struct LengthExceeded {
    /// Length that was requested.
    pub size: usize,
    /// Configured maximum.
    pub limit: usize,
}

impl From<LengthExceeded> for CompressionError {
    fn from(err: LengthExceeded) -> Self {
        CompressionError::SizeExceeded {
            size: err.size,
            limit: err.limit,
        }
    }
}

/// Allocator limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorLimits {
    /// Maximum number of buffers per pool.
    pub count: usize,
    /// Largest buffer kept in a pool.
    pub pooled_length: usize,
    /// Growth step below `pooled_length`.
    pub pooled_expand_length: usize,
    /// Growth step above `pooled_length`.
    pub expand_length: usize,
    /// Largest message buffer.
    pub max_length: usize,
}

impl From<&HostConfig> for AllocatorLimits {
    fn from(config: &HostConfig) -> Self {
        Self {
            count: config.allocator_count,
            pooled_length: config.allocator_pooled_length,
            pooled_expand_length: config.allocator_pooled_expand_length.max(1),
            expand_length: config.allocator_expand_length.max(1),
            max_length: config.allocator_max_length,
        }
    }
}

impl Default for AllocatorLimits {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

/// Pools of packet, message, key, IV and hash-table buffers.
#[derive(Debug)]
pub struct Allocator {
    limits: AllocatorLimits,
    packets: ArrayPool<u8>,
    messages: ArrayPool<u8>,
    keys: ArrayPool<u8>,
    ivs: ArrayPool<u8>,
    hash_tables: ArrayPool<u32>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(AllocatorLimits::default())
    }
}

impl Allocator {
    /// Create an allocator with the given limits.
    pub fn new(limits: AllocatorLimits) -> Self {
        let count = limits.count;
        let pooled = limits.pooled_length;
        Self {
            limits,
            packets: ArrayPool::new(count, pooled),
            messages: ArrayPool::new(count, pooled),
            keys: ArrayPool::new(count, pooled),
            ivs: ArrayPool::new(count, pooled),
            hash_tables: ArrayPool::new(count, LZF_HSIZE),
        }
    }

    /// Create an allocator that never pools anything.
    pub fn unpooled() -> Self {
        Self::new(AllocatorLimits {
            count: 0,
            pooled_length: 0,
            pooled_expand_length: 1,
            expand_length: 1,
            max_length: usize::MAX,
        })
    }

    /// Configured limits.
    pub fn limits(&self) -> AllocatorLimits {
        self.limits
    }

    /// Largest message buffer this allocator hands out without a warning.
    pub fn max_length(&self) -> usize {
        self.limits.max_length
    }

    fn check_length(&self, kind: &'static str, len: usize) {
        if len > self.limits.max_length {
            warn!(
                kind,
                len,
                limit = self.limits.max_length,
                "allocation beyond max length, falling back to unpooled buffer"
            );
        }
    }

    /// Buffer for a single datagram.
    pub fn create_packet(&self, len: usize) -> Vec<u8> {
        self.check_length("packet", len);
        self.packets.rent(len)
    }

    /// Return a datagram buffer.
    pub fn return_packet(&self, buf: Vec<u8>) {
        self.packets.give(buf);
    }

    /// Buffer for a message body.
    pub fn create_message(&self, len: usize) -> Vec<u8> {
        self.check_length("message", len);
        self.messages.rent(len)
    }

    /// Return a message buffer.
    pub fn return_message(&self, buf: Vec<u8>) {
        self.messages.give(buf);
    }

    #[cfg(test)]
    pub(crate) fn pooled_messages(&self) -> usize {
        self.messages.len()
    }

    /// Grow `buf` so it holds at least `used + extra` bytes, keeping the
    /// first `used` bytes.
    ///
    /// The new length is rounded up to the pooled expand step while below the
    /// pooled length and to the expand step above it.
    pub fn expand_message(
        &self,
        buf: &mut Vec<u8>,
        used: usize,
        extra: usize,
    ) -> Result<(), LengthExceeded> {
        let needed = used.saturating_add(extra);
        if needed > self.limits.max_length {
            return Err(LengthExceeded {
                size: needed,
                limit: self.limits.max_length,
            });
        }
        if needed <= buf.len() {
            return Ok(());
        }
        let step = if needed < self.limits.pooled_length {
            self.limits.pooled_expand_length
        } else {
            self.limits.expand_length
        };
        let grown = needed.div_ceil(step).saturating_mul(step);
        let len = grown.min(self.limits.max_length).max(needed);
        buf.truncate(used.min(buf.len()));
        buf.resize(len, 0);
        Ok(())
    }

    /// Buffer for key material.
    pub fn create_key(&self, len: usize) -> Vec<u8> {
        self.keys.rent(len)
    }

    /// Return a key buffer. The contents are wiped before pooling.
    pub fn return_key(&self, mut buf: Vec<u8>) {
        buf.zeroize();
        self.keys.give(buf);
    }

    /// Buffer for an initialization vector.
    pub fn create_iv(&self, len: usize) -> Vec<u8> {
        self.ivs.rent(len)
    }

    /// Return an IV buffer.
    pub fn return_iv(&self, buf: Vec<u8>) {
        self.ivs.give(buf);
    }

    /// Zeroed LZF hash table.
    pub fn create_hash_table(&self) -> Vec<u32> {
        let mut table = self.hash_tables.rent(LZF_HSIZE);
        table.fill(0);
        table
    }

    /// Return an LZF hash table.
    pub fn return_hash_table(&self, table: Vec<u32>) {
        self.hash_tables.give(table);
    }

    /// Drop every pooled buffer.
    pub fn clear(&self) {
        self.packets.clear();
        self.messages.clear();
        self.keys.clear();
        self.ivs.clear();
        self.hash_tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AllocatorLimits {
        AllocatorLimits {
            count: 4,
            pooled_length: 1024,
            pooled_expand_length: 128,
            expand_length: 4096,
            max_length: 10_000,
        }
    }

    #[test]
    fn test_create_returns_requested_length() {
        let allocator = Allocator::new(limits());
        assert_eq!(allocator.create_packet(100).len(), 100);
        assert_eq!(allocator.create_message(0).len(), 0);
        assert_eq!(allocator.create_key(32).len(), 32);
        assert_eq!(allocator.create_iv(16).len(), 16);
        assert_eq!(allocator.create_hash_table().len(), LZF_HSIZE);
    }

    #[test]
    fn test_beyond_max_length_still_allocates() {
        let allocator = Allocator::new(limits());
        assert_eq!(allocator.create_message(20_000).len(), 20_000);
    }

    #[test]
    fn test_expand_keeps_content() {
        let allocator = Allocator::new(limits());
        let mut buf = allocator.create_message(4);
        buf.copy_from_slice(b"abcd");
        allocator.expand_message(&mut buf, 4, 10).unwrap();
        assert_eq!(buf.len(), 128);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn test_expand_steps() {
        let allocator = Allocator::new(limits());
        let mut buf = Vec::new();
        allocator.expand_message(&mut buf, 0, 129).unwrap();
        assert_eq!(buf.len(), 256);

        // Above the pooled length the larger step applies, capped at max
        allocator.expand_message(&mut buf, 256, 2000).unwrap();
        assert_eq!(buf.len(), 4096);
        allocator.expand_message(&mut buf, 4096, 5000).unwrap();
        assert_eq!(buf.len(), 10_000);
    }

    #[test]
    fn test_expand_beyond_max_fails() {
        let allocator = Allocator::new(limits());
        let mut buf = vec![0; 16];
        let err = allocator.expand_message(&mut buf, 16, 10_000).unwrap_err();
        assert_eq!(
            err,
            LengthExceeded {
                size: 10_016,
                limit: 10_000
            }
        );
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_return_key_wipes() {
        let allocator = Allocator::new(limits());
        let mut key = allocator.create_key(32);
        key.fill(0xAA);
        allocator.return_key(key);
        // zeroize clears the vector before it is pooled
        let key = allocator.create_key(32);
        assert!(key.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hash_table_is_zeroed() {
        let allocator = Allocator::new(limits());
        let mut table = allocator.create_hash_table();
        table[7] = 99;
        allocator.return_hash_table(table);
        let table = allocator.create_hash_table();
        assert_eq!(table[7], 0);
    }

    #[test]
    fn test_unpooled_and_clear() {
        let allocator = Allocator::unpooled();
        allocator.return_packet(vec![0; 8]);
        assert_eq!(allocator.create_packet(8).len(), 8);

        let allocator = Allocator::new(limits());
        allocator.return_message(vec![0; 8]);
        allocator.clear();
        assert!(allocator.messages.is_empty());
    }
}
