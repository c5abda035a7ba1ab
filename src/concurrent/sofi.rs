//! Safely overflowing FIFO.
//!
//! A single-producer/single-consumer ring buffer that never rejects a push:
//! when full, the oldest element is evicted and handed back to the producer,
//! so the newest value is never lost.
//!
//! # Algorithm
//!
//! Read and write positions are monotonically increasing `u64`s; a slot is
//! `position % internal_size`, where `internal_size = capacity + 1`. The spare
//! slot keeps the producer from ever writing the slot the consumer is about to
//! read while the buffer is not overflowing.
//!
//! - **Push (producer)**: write the slot, publish the write position
//!   (release), then load the read position (acquire). If the buffer was
//!   full, read the oldest slot and CAS the read position forward; winning
//!   the CAS means the producer evicted that value.
//! - **Pop (consumer)**: load both positions; if not empty, read the head
//!   slot and CAS the read position forward. Losing the CAS means the
//!   producer evicted the head concurrently; retry with the new head.
//!
//! Both sides race for the head only through the CAS, so each element leaves
//! the buffer exactly once: popped, or evicted.

use crate::memory::ShmSafe;
use std::sync::atomic::{
    AtomicI32, AtomicI64, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence,
};

/// Keeps a position on its own cache line.
#[repr(C, align(64))]
struct CachePadded<T>(T);

/// A value a [`SoFi`] can carry: a plain word with a matching atomic cell.
///
/// Slots are read while the producer may be overwriting them, so every slot
/// access is a relaxed atomic load or store. Ordering comes from the
/// positions.
pub trait SoFiValue: Copy + Send + 'static {
    /// Atomic cell holding one value.
    type Slot: ShmSafe + Send + Sync;

    /// Initial slot contents.
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Self::Slot;

    /// Relaxed load of a slot.
    fn load(slot: &Self::Slot) -> Self;

    /// Relaxed store into a slot.
    fn store(slot: &Self::Slot, value: Self);
}

macro_rules! impl_sofi_value {
    ($($ty:ty => $atomic:ty),* $(,)?) => {
        $(
            impl SoFiValue for $ty {
                type Slot = $atomic;

                #[allow(clippy::declare_interior_mutable_const)]
                const EMPTY: $atomic = <$atomic>::new(0);

                #[inline]
                fn load(slot: &$atomic) -> $ty {
                    slot.load(Ordering::Relaxed)
                }

                #[inline]
                fn store(slot: &$atomic, value: $ty) {
                    slot.store(value, Ordering::Relaxed)
                }
            }
        )*
    };
}

impl_sofi_value!(
    u8 => AtomicU8,
    u16 => AtomicU16,
    u32 => AtomicU32,
    u64 => AtomicU64,
    usize => AtomicUsize,
    i32 => AtomicI32,
    i64 => AtomicI64,
);

/// Single-producer/single-consumer ring buffer with overflow semantics.
///
/// At most one thread (or process) may push and at most one may pop at any
/// time. `push` and `pop` take `&self` so the buffer can live in shared
/// memory; the discipline is a contract on the caller. Violating it can
/// duplicate or lose elements but cannot tear the positions or the slots.
///
/// Values are words ([`SoFiValue`]) held in atomic slots: the consumer may
/// copy a slot the producer is overwriting, and only copies validated by the
/// read position are returned.
///
/// # Example
///
/// ```rust,ignore
/// use shoal::concurrent::SoFi;
///
/// let sofi: SoFi<u32, 2> = SoFi::new();
/// assert_eq!(sofi.push(1), None);
/// assert_eq!(sofi.push(2), None);
/// assert_eq!(sofi.push(3), Some(1)); // oldest evicted
/// assert_eq!(sofi.pop(), Some(2));
/// ```
#[repr(C)]
pub struct SoFi<T: SoFiValue, const CAPACITY: usize> {
    read_position: CachePadded<AtomicU64>,
    write_position: CachePadded<AtomicU64>,
    /// Active capacity + 1. Only changed through `&mut self`.
    internal_size: AtomicU64,
    data: [T::Slot; CAPACITY],
    /// The extra slot at index `CAPACITY`.
    spare: T::Slot,
}

impl<T: SoFiValue, const CAPACITY: usize> SoFi<T, CAPACITY> {
    /// Create an empty buffer with capacity `CAPACITY`.
    pub const fn new() -> Self {
        Self {
            read_position: CachePadded(AtomicU64::new(0)),
            write_position: CachePadded(AtomicU64::new(0)),
            internal_size: AtomicU64::new(CAPACITY as u64 + 1),
            data: [const { T::EMPTY }; CAPACITY],
            spare: T::EMPTY,
        }
    }

    #[inline]
    fn slot(&self, position: u64) -> &T::Slot {
        let size = self.internal_size.load(Ordering::Relaxed);
        let index = (position % size) as usize;
        self.data.get(index).unwrap_or(&self.spare)
    }

    /// Push a value.
    ///
    /// Returns `None` if the value was stored without eviction, or
    /// `Some(oldest)` if the buffer was full: the oldest element was removed
    /// and is returned, and `value` was stored.
    ///
    /// Must only be called by the single producer.
    pub fn push(&self, value: T) -> Option<T> {
        let write = self.write_position.0.load(Ordering::Relaxed);
        let next_write = write + 1;

        // Order the previous eviction CAS before this slot store, so a
        // consumer that copies the new value also sees the read position move.
        fence(Ordering::Release);
        T::store(self.slot(write), value);
        self.write_position.0.store(next_write, Ordering::Release);

        let read = self.read_position.0.load(Ordering::Acquire);
        if next_write < read + self.internal_size.load(Ordering::Relaxed) {
            return None;
        }

        // Only the producer stores slots, so this copy is stable.
        let evicted = T::load(self.slot(read));
        match self.read_position.0.compare_exchange(
            read,
            read + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => Some(evicted),
            // The consumer popped the head meanwhile, making room.
            Err(_) => None,
        }
    }

    /// Pop the oldest element.
    ///
    /// Must only be called by the single consumer.
    pub fn pop(&self) -> Option<T> {
        self.pop_if(|_| true)
    }

    /// Pop the oldest element only if `predicate` accepts it.
    ///
    /// If the predicate rejects the head, the buffer is left untouched.
    /// The predicate may run more than once if the head is evicted
    /// concurrently.
    ///
    /// Must only be called by the single consumer.
    pub fn pop_if<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut read = self.read_position.0.load(Ordering::Acquire);
        loop {
            let write = self.write_position.0.load(Ordering::Acquire);
            if read == write {
                return None;
            }

            let value = T::load(self.slot(read));
            fence(Ordering::Acquire);
            let current = self.read_position.0.load(Ordering::Relaxed);
            if current != read {
                // Evicted while we were copying it
                read = current;
                continue;
            }

            // The read position did not move, so the copy predates any
            // overwrite of this slot.
            if !predicate(&value) {
                return None;
            }

            match self.read_position.0.compare_exchange_weak(
                read,
                read + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(value),
                Err(actual) => read = actual,
            }
        }
    }

    /// Returns true if the buffer holds no elements (snapshot).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of elements in the buffer (snapshot).
    ///
    /// Derived from a consistent pair of positions, so it cannot drift from
    /// the buffer's contents.
    pub fn size(&self) -> usize {
        loop {
            let write = self.write_position.0.load(Ordering::Acquire);
            let read = self.read_position.0.load(Ordering::Acquire);
            if write == self.write_position.0.load(Ordering::Acquire) {
                // Mid-overflow the distance is briefly capacity + 1
                let used = write.saturating_sub(read) as usize;
                return used.min(self.capacity());
            }
        }
    }

    /// Active capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.internal_size.load(Ordering::Relaxed) - 1) as usize
    }

    /// Change the active capacity.
    ///
    /// Succeeds only if `capacity <= CAPACITY` and the buffer is empty.
    /// `&mut self` guarantees no push or pop is in flight in this process;
    /// for a buffer in shared memory the other side must be quiescent too.
    pub fn set_capacity(&mut self, capacity: usize) -> bool {
        if capacity > CAPACITY || !self.is_empty() {
            return false;
        }
        *self.internal_size.get_mut() = capacity as u64 + 1;
        *self.read_position.0.get_mut() = 0;
        *self.write_position.0.get_mut() = 0;
        true
    }
}

impl<T: SoFiValue, const CAPACITY: usize> Default for SoFi<T, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SoFiValue, const CAPACITY: usize> std::fmt::Debug for SoFi<T, CAPACITY> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoFi")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .finish()
    }
}

// SAFETY: positions are plain counters and slots are ShmSafe atomics.
unsafe impl<T: SoFiValue, const CAPACITY: usize> ShmSafe for SoFi<T, CAPACITY> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let sofi: SoFi<u32, 4> = SoFi::new();
        assert!(sofi.is_empty());
        assert_eq!(sofi.pop(), None);

        for i in 0..4 {
            assert_eq!(sofi.push(i), None);
        }
        assert_eq!(sofi.size(), 4);

        for i in 0..4 {
            assert_eq!(sofi.pop(), Some(i));
        }
        assert!(sofi.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let sofi: SoFi<u32, 3> = SoFi::new();
        for i in 0..3 {
            assert_eq!(sofi.push(i), None);
        }
        assert_eq!(sofi.push(3), Some(0));
        assert_eq!(sofi.push(4), Some(1));
        assert_eq!(sofi.size(), 3);

        assert_eq!(sofi.pop(), Some(2));
        assert_eq!(sofi.pop(), Some(3));
        assert_eq!(sofi.pop(), Some(4));
        assert_eq!(sofi.pop(), None);
    }

    #[test]
    fn test_wraps_many_times() {
        let sofi: SoFi<u64, 5> = SoFi::new();
        for round in 0..100u64 {
            sofi.push(round * 2);
            sofi.push(round * 2 + 1);
            assert_eq!(sofi.pop(), Some(round * 2));
            assert_eq!(sofi.pop(), Some(round * 2 + 1));
        }
        assert!(sofi.is_empty());
    }

    #[test]
    fn test_pop_if_rejects_without_consuming() {
        let sofi: SoFi<u32, 4> = SoFi::new();
        sofi.push(10);
        sofi.push(20);

        assert_eq!(sofi.pop_if(|v| *v > 15), None);
        assert_eq!(sofi.size(), 2);
        assert_eq!(sofi.pop_if(|v| *v == 10), Some(10));
        assert_eq!(sofi.pop(), Some(20));
    }

    #[test]
    fn test_set_capacity() {
        let mut sofi: SoFi<u32, 8> = SoFi::new();
        assert_eq!(sofi.capacity(), 8);

        assert!(!sofi.set_capacity(9));
        assert!(sofi.set_capacity(2));
        assert_eq!(sofi.capacity(), 2);

        sofi.push(1);
        sofi.push(2);
        assert_eq!(sofi.push(3), Some(1));
        assert!(!sofi.set_capacity(4));

        sofi.pop();
        sofi.pop();
        assert!(sofi.set_capacity(8));
        assert_eq!(sofi.capacity(), 8);
        assert!(sofi.is_empty());
    }

    #[test]
    fn test_capacity_zero_returns_pushed_value() {
        let sofi: SoFi<u32, 0> = SoFi::new();
        assert_eq!(sofi.capacity(), 0);
        assert_eq!(sofi.push(7), Some(7));
        assert_eq!(sofi.pop(), None);
        assert_eq!(sofi.size(), 0);
    }

    /// A consumer holding a stale head while the producer evicts and then
    /// overwrites that slot never returns the overwritten value.
    #[test]
    fn test_stale_head_overwritten_during_pop() {
        const TOTAL: u64 = 200_000;
        let sofi: SoFi<u64, 1> = SoFi::new();

        let (popped, evicted) = std::thread::scope(|scope| {
            let consumer = scope.spawn(|| {
                let mut popped = Vec::new();
                let mut last = None;
                // The last value is never evicted, so it always arrives
                loop {
                    if let Some(value) = sofi.pop() {
                        popped.push(value);
                        last = Some(value);
                    }
                    if last == Some(TOTAL - 1) {
                        return popped;
                    }
                    std::hint::spin_loop();
                }
            });

            let mut evicted = Vec::new();
            for value in 0..TOTAL {
                evicted.extend(sofi.push(value));
            }
            (consumer.join().unwrap(), evicted)
        });

        assert!(popped.windows(2).all(|w| w[0] < w[1]), "popped out of order");
        assert!(evicted.windows(2).all(|w| w[0] < w[1]), "evicted out of order");
        let mut all: Vec<_> = popped.iter().chain(&evicted).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..TOTAL).collect::<Vec<_>>());
    }

    #[test]
    fn test_word_types() {
        let bytes: SoFi<u8, 2> = SoFi::new();
        assert_eq!(bytes.push(u8::MAX), None);
        assert_eq!(bytes.pop(), Some(u8::MAX));

        let signed: SoFi<i64, 2> = SoFi::new();
        signed.push(-1);
        signed.push(-2);
        assert_eq!(signed.push(-3), Some(-1));
        assert_eq!(signed.pop(), Some(-2));
    }

    #[test]
    fn test_positions_on_separate_cache_lines() {
        let sofi: SoFi<u8, 1> = SoFi::new();
        let read = &sofi.read_position as *const _ as usize;
        let write = &sofi.write_position as *const _ as usize;
        assert!(write.abs_diff(read) >= crate::defaults::CACHE_LINE_SIZE);
    }
}
