//! Unique identifiers for regions and other shared objects.
//!
//! Ids come from an explicit [`UniqueIdCounter`] owned by whoever hands them
//! out (usually a [`SegmentManager`](crate::memory::SegmentManager)), never
//! from a process global. Tests construct a fresh counter each.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(u64);

impl UniqueId {
    /// Wrap a raw id value (e.g. one read back from a region header).
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source.
///
/// Thread-safe; ids are never reused for the lifetime of the counter.
#[derive(Debug)]
pub struct UniqueIdCounter {
    next: AtomicU64,
}

impl UniqueIdCounter {
    /// Create a counter whose first id is 1 (0 is never handed out).
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a counter whose first id is `first`.
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Hand out the next id.
    #[inline]
    pub fn next(&self) -> UniqueId {
        UniqueId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The id the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> UniqueId {
        UniqueId(self.next.load(Ordering::Relaxed))
    }
}

impl Default for UniqueIdCounter {
    fn default() -> Self {
        Self::new()
    }
}
