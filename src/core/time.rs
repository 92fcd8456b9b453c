//! Host-relative time.
//!
//! All protocol timestamps are milliseconds since the host clock started.
//! Only the low 16 bits travel on the wire; receivers reconstruct the full
//! value relative to their own clock.

use std::fmt;
use std::time::{Duration, Instant};

/// Monotonic millisecond clock owned by a host.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: Instant,
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock {
    /// Start a clock at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Start a clock at a specific instant.
    pub fn with_origin(origin: Instant) -> Self {
        Self { origin }
    }

    /// Milliseconds elapsed at `now`.
    pub fn ticks(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.origin).as_millis() as i64
    }

    /// Timestamp at `now`.
    pub fn timestamp(&self, now: Instant) -> HostTimestamp {
        HostTimestamp(self.ticks(now))
    }

    /// Timestamp of the current instant.
    pub fn now(&self) -> HostTimestamp {
        self.timestamp(Instant::now())
    }
}

/// A point in host time, in milliseconds since the host started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostTimestamp(pub i64);

impl HostTimestamp {
    /// Create from raw milliseconds.
    pub fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Raw milliseconds.
    pub fn ticks(self) -> i64 {
        self.0
    }

    /// Low 16 bits as sent on the wire.
    pub fn slice(self) -> u16 {
        self.0 as u16
    }

    /// Time elapsed between `earlier` and this timestamp, zero if negative.
    pub fn since(self, earlier: HostTimestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Reconstruct a full timestamp from a 16-bit slice, choosing the value
    /// closest to `reference`.
    pub fn from_slice(slice: u16, reference: HostTimestamp) -> Self {
        let mut ticks = (reference.0 & !0xFFFF) | i64::from(slice);
        if ticks - 32768 > reference.0 {
            ticks -= 65536;
        }
        if ticks + 32768 < reference.0 {
            ticks += 65536;
        }
        Self(ticks)
    }
}

impl fmt::Display for HostTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
