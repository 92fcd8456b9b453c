//! Bounded buffer pool.

use parking_lot::Mutex;

/// A bounded pool of reusable vectors.
///
/// Holds at most `capacity` vectors, each no longer than `max_length`.
/// Vectors that exceed either bound on return are dropped.
#[derive(Debug)]
pub struct ArrayPool<T> {
    slots: Mutex<Vec<Vec<T>>>,
    capacity: usize,
    max_length: usize,
}

impl<T: Clone + Default> ArrayPool<T> {
    /// Create an empty pool.
    pub fn new(capacity: usize, max_length: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
            max_length,
        }
    }

    /// Take a vector of exactly `len` elements, reusing a pooled one when possible.
    ///
    /// Reused vectors keep their previous contents up to `len`; callers
    /// overwrite what they use.
    pub fn rent(&self, len: usize) -> Vec<T> {
        let pooled = if len <= self.max_length {
            self.slots.lock().pop()
        } else {
            None
        };
        let mut buf = pooled.unwrap_or_default();
        buf.resize(len, T::default());
        buf
    }

    /// Put a vector back. Oversized vectors and vectors beyond capacity are dropped.
    pub fn give(&self, buf: Vec<T>) {
        if buf.capacity() > self.max_length || self.capacity == 0 {
            return;
        }
        let mut slots = self.slots.lock();
        if slots.len() < self.capacity {
            slots.push(buf);
        }
    }

    /// Number of pooled vectors.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the pool holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pooled vector.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_and_reuse() {
        let pool: ArrayPool<u8> = ArrayPool::new(2, 64);
        let mut buf = pool.rent(10);
        assert_eq!(buf.len(), 10);
        buf[0] = 42;
        pool.give(buf);
        assert_eq!(pool.len(), 1);

        let buf = pool.rent(20);
        assert_eq!(buf.len(), 20);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let pool: ArrayPool<u8> = ArrayPool::new(1, 64);
        pool.give(vec![0; 8]);
        pool.give(vec![0; 8]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool: ArrayPool<u8> = ArrayPool::new(4, 16);
        pool.give(vec![0; 100]);
        assert!(pool.is_empty());

        // Oversized requests never come from the pool either
        pool.give(vec![0; 8]);
        let buf = pool.rent(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_zero_capacity_never_pools() {
        let pool: ArrayPool<u32> = ArrayPool::new(0, 16);
        pool.give(vec![0; 4]);
        assert!(pool.is_empty());
    }
}
