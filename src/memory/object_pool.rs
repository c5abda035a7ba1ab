//! Fixed-capacity object pool addressed by index.
//!
//! The pool is an inline array of cells, so it can be placed in shared memory
//! (see [`ShmRegion`](super::ShmRegion)) and used from several processes at
//! once. Indices are the process-independent handle; pointers obtained from
//! [`index_to_pointer`](ObjectPool::index_to_pointer) are only valid in the
//! mapping they were derived from.
//!
//! # Cell lifecycle
//!
//! ```text
//!            reserve                 construct
//!   Empty ────────────► Reserved ──────────────► Constructed
//!     ▲                    │                          │
//!     │                    │ remove / take            │ remove / take
//!     │                    ▼                          ▼
//!     └──────────────── Releasing ◄───────────────────┘
//! ```
//!
//! Every transition out of `Empty` and into `Releasing` is a CAS on the
//! cell's state tag, so two concurrent claims never hand out the same cell
//! and two concurrent removes never drop the same value.

use super::ShmSafe;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const EMPTY: u8 = 0;
const RESERVED: u8 = 1;
const CONSTRUCTED: u8 = 2;
/// Transient: a remove/take owns the cell and is tearing it down.
const RELEASING: u8 = 3;

/// Observable state of a pool cell.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Free for allocation.
    Empty = EMPTY,
    /// Claimed, but storage not (yet) initialized by the pool.
    Reserved = RESERVED,
    /// Claimed and holding a live value.
    Constructed = CONSTRUCTED,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            RESERVED => SlotState::Reserved,
            CONSTRUCTED => SlotState::Constructed,
            // A releasing cell is on its way to empty
            _ => SlotState::Empty,
        }
    }
}

#[repr(C)]
struct Cell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Cell<T> {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    fn value_ptr(&self) -> *mut T {
        self.value.get().cast::<T>()
    }
}

/// A pool of `CAPACITY` cells of `T`.
///
/// Allocation scans from a moving cursor and claims the first empty cell with
/// a CAS, so it is bounded by `CAPACITY` steps and never waits on another
/// thread. Freeing is O(1).
///
/// Indices are reused. A stale index held after its cell was removed and
/// re-allocated silently refers to the new occupant; callers must not keep
/// indices past the matching `remove`.
///
/// # Example
///
/// ```rust,ignore
/// use shoal::memory::ObjectPool;
///
/// let pool: ObjectPool<u64, 4> = ObjectPool::new();
/// let index = pool.construct(42).unwrap();
/// assert_eq!(unsafe { pool.get_ref(index) }, Some(&42));
/// pool.remove(index, true);
/// assert!(pool.is_empty());
/// ```
#[repr(C)]
pub struct ObjectPool<T, const CAPACITY: usize> {
    cells: [Cell<T>; CAPACITY],
    /// Where the next free-cell scan starts.
    next_free: AtomicUsize,
    /// Number of claimed cells.
    size: AtomicUsize,
}

impl<T, const CAPACITY: usize> ObjectPool<T, CAPACITY> {
    /// Create an empty pool.
    pub const fn new() -> Self {
        Self {
            cells: [const { Cell::new() }; CAPACITY],
            next_free: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    /// Claim an empty cell, leaving its storage uninitialized.
    fn claim(&self) -> Option<usize> {
        if CAPACITY == 0 {
            return None;
        }

        let start = self.next_free.load(Ordering::Relaxed) % CAPACITY;
        for offset in 0..CAPACITY {
            let index = (start + offset) % CAPACITY;
            if self.cells[index]
                .state
                .compare_exchange(EMPTY, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.size.fetch_add(1, Ordering::Relaxed);
                self.next_free
                    .store((index + 1) % CAPACITY, Ordering::Relaxed);
                return Some(index);
            }
        }
        None
    }

    /// Hand a claimed cell back to the free set.
    fn release(&self, index: usize) {
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.cells[index].state.store(EMPTY, Ordering::Release);
    }

    /// Claim a cell without constructing a value in it.
    ///
    /// The cell is `Reserved`; its storage may be written through
    /// [`get`](Self::get) and published with
    /// [`mark_constructed`](Self::mark_constructed), or it is simply removed
    /// again with `destruct = false`.
    ///
    /// Returns `None` if the pool is full.
    pub fn reserve(&self) -> Option<usize> {
        self.claim()
    }

    /// Claim a cell and move `value` into it.
    ///
    /// Hands `value` back if the pool is full.
    pub fn construct(&self, value: T) -> Result<usize, T> {
        let Some(index) = self.claim() else {
            return Err(value);
        };
        let cell = &self.cells[index];
        // SAFETY: the claim gives us exclusive access to the storage.
        unsafe { cell.value_ptr().write(value) };
        cell.state.store(CONSTRUCTED, Ordering::Release);
        Ok(index)
    }

    /// Claim a cell and construct its value with `f`.
    ///
    /// `f` is not called if the pool is full.
    pub fn construct_with<F>(&self, f: F) -> Option<usize>
    where
        F: FnOnce() -> T,
    {
        let index = self.claim()?;
        let cell = &self.cells[index];
        // SAFETY: the claim gives us exclusive access to the storage.
        unsafe { cell.value_ptr().write(f()) };
        cell.state.store(CONSTRUCTED, Ordering::Release);
        Some(index)
    }

    /// Claim a cell holding a clone of `value`.
    pub fn add(&self, value: &T) -> Option<usize>
    where
        T: Clone,
    {
        self.construct_with(|| value.clone())
    }

    /// Mark a reserved cell whose storage was written in place as constructed.
    ///
    /// Returns `false` if the cell was not `Reserved`.
    ///
    /// # Safety
    ///
    /// The storage of the cell must hold a fully initialized `T`.
    pub unsafe fn mark_constructed(&self, index: usize) -> bool {
        self.cells[index]
            .state
            .compare_exchange(RESERVED, CONSTRUCTED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Free a cell.
    ///
    /// The value is dropped only if `destruct` is set and the cell was
    /// `Constructed`. Removing an empty cell is a no-op, so a second remove of
    /// the same index neither changes [`size`](Self::size) nor drops twice.
    ///
    /// # Panics
    ///
    /// Panics if `index >= CAPACITY`.
    pub fn remove(&self, index: usize, destruct: bool) {
        let Some(previous) = self.begin_release(index, &[RESERVED, CONSTRUCTED]) else {
            return;
        };
        if destruct && previous == CONSTRUCTED {
            // SAFETY: the cell was constructed and RELEASING makes us the only
            // party that can touch its storage.
            unsafe { std::ptr::drop_in_place(self.cells[index].value_ptr()) };
        }
        self.release(index);
    }

    /// Move the value out of a constructed cell and free the cell.
    ///
    /// Returns `None` (and leaves the cell alone) if it was not `Constructed`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= CAPACITY`.
    pub fn take(&self, index: usize) -> Option<T> {
        self.begin_release(index, &[CONSTRUCTED])?;
        // SAFETY: constructed, and exclusively ours while RELEASING.
        let value = unsafe { self.cells[index].value_ptr().read() };
        self.release(index);
        Some(value)
    }

    /// CAS the cell from one of `from` into `RELEASING`, returning the prior state.
    fn begin_release(&self, index: usize, from: &[u8]) -> Option<u8> {
        let state = &self.cells[index].state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if !from.contains(&current) {
                return None;
            }
            match state.compare_exchange_weak(
                current,
                RELEASING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Pointer to the storage of a valid (`Reserved` or `Constructed`) cell.
    ///
    /// # Panics
    ///
    /// Panics if `index >= CAPACITY`.
    pub fn get(&self, index: usize) -> Option<NonNull<T>> {
        let cell = &self.cells[index];
        match cell.state.load(Ordering::Acquire) {
            RESERVED | CONSTRUCTED => NonNull::new(cell.value_ptr()),
            _ => None,
        }
    }

    /// Shared reference to the value of a constructed cell.
    ///
    /// # Safety
    ///
    /// The cell must not be removed, taken, or written through a pointer while
    /// the reference is alive.
    ///
    /// # Panics
    ///
    /// Panics if `index >= CAPACITY`.
    pub unsafe fn get_ref(&self, index: usize) -> Option<&T> {
        let cell = &self.cells[index];
        if cell.state.load(Ordering::Acquire) != CONSTRUCTED {
            return None;
        }
        // SAFETY: constructed; liveness is the caller's obligation.
        Some(unsafe { &*cell.value_ptr() })
    }

    /// Pointer to the storage of cell `index`, whatever its state.
    ///
    /// Returns `None` only if `index` is out of range.
    pub fn index_to_pointer(&self, index: usize) -> Option<NonNull<T>> {
        self.cells
            .get(index)
            .and_then(|cell| NonNull::new(cell.value_ptr()))
    }

    /// Index of the cell whose storage `ptr` points to.
    ///
    /// Returns `None` for pointers outside this mapping of the pool or not on
    /// a cell boundary.
    pub fn pointer_to_index(&self, ptr: *const T) -> Option<usize> {
        let first = self.cells.first()?.value_ptr() as usize;
        let address = ptr as usize;
        let offset = address.checked_sub(first)?;

        let stride = std::mem::size_of::<Cell<T>>();
        if offset % stride != 0 {
            return None;
        }
        let index = offset / stride;
        (index < CAPACITY).then_some(index)
    }

    /// Pointer-flavoured [`reserve`](Self::reserve).
    pub fn allocate(&self) -> Option<NonNull<T>> {
        self.reserve().and_then(|index| self.index_to_pointer(index))
    }

    /// Pointer-flavoured [`construct`](Self::construct).
    pub fn create(&self, value: T) -> Result<NonNull<T>, T> {
        self.construct(value).map(|index| self.pointer_at(index))
    }

    /// Pointer-flavoured [`construct_with`](Self::construct_with).
    pub fn create_with<F>(&self, f: F) -> Option<NonNull<T>>
    where
        F: FnOnce() -> T,
    {
        self.construct_with(f).map(|index| self.pointer_at(index))
    }

    /// Pointer-flavoured [`add`](Self::add).
    pub fn insert(&self, value: &T) -> Option<NonNull<T>>
    where
        T: Clone,
    {
        self.add(value).map(|index| self.pointer_at(index))
    }

    /// Free the cell `ptr` points to, dropping its value if constructed.
    ///
    /// Pointers that do not belong to this pool are ignored.
    pub fn free(&self, ptr: NonNull<T>) {
        if let Some(index) = self.pointer_to_index(ptr.as_ptr()) {
            self.remove(index, true);
        }
    }

    fn pointer_at(&self, index: usize) -> NonNull<T> {
        NonNull::from(&self.cells[index].value).cast::<T>()
    }

    /// Iterate over valid cells as `(index, pointer)` pairs.
    ///
    /// Visits every cell, so this is O(`CAPACITY`) regardless of size.
    pub fn iter(&self) -> impl Iterator<Item = (usize, NonNull<T>)> + '_ {
        (0..CAPACITY).filter_map(move |index| self.get(index).map(|ptr| (index, ptr)))
    }

    /// Number of claimed cells.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of cells.
    #[inline]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Returns true if no cell is claimed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true if every cell is claimed.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() >= CAPACITY
    }

    /// State of cell `index`, or `None` if out of range.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.cells
            .get(index)
            .map(|cell| SlotState::from_u8(cell.state.load(Ordering::Acquire)))
    }
}

impl<T, const CAPACITY: usize> Default for ObjectPool<T, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CAPACITY: usize> Drop for ObjectPool<T, CAPACITY> {
    fn drop(&mut self) {
        for cell in self.cells.iter_mut() {
            if *cell.state.get_mut() == CONSTRUCTED {
                // SAFETY: constructed, and &mut self rules out other access.
                unsafe { cell.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T, const CAPACITY: usize> std::fmt::Debug for ObjectPool<T, CAPACITY> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &CAPACITY)
            .field("size", &self.size())
            .finish()
    }
}

// SAFETY: values are written only by the thread that claimed the cell and
// dropped only by the thread that won the RELEASING transition; shared access
// hands out &T, which needs T: Sync.
unsafe impl<T: Send + Sync, const CAPACITY: usize> Sync for ObjectPool<T, CAPACITY> {}

// SAFETY: an inline array of atomics and cells; a ShmSafe T keeps it free of
// process-local pointers.
unsafe impl<T: ShmSafe + Send, const CAPACITY: usize> ShmSafe for ObjectPool<T, CAPACITY> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_construct_and_get() {
        let pool: ObjectPool<u64, 4> = ObjectPool::new();
        let index = pool.construct(42).unwrap();

        assert_eq!(pool.size(), 1);
        assert_eq!(pool.slot_state(index), Some(SlotState::Constructed));
        assert_eq!(unsafe { pool.get_ref(index) }, Some(&42));
        assert!(pool.get(index).is_some());
    }

    #[test]
    fn test_full_pool_returns_value() {
        let pool: ObjectPool<String, 2> = ObjectPool::new();
        pool.construct("a".to_string()).unwrap();
        pool.construct("b".to_string()).unwrap();

        assert!(pool.is_full());
        assert_eq!(pool.construct("c".to_string()), Err("c".to_string()));
        assert_eq!(pool.reserve(), None);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_construct_with_not_called_when_full() {
        let pool: ObjectPool<u32, 1> = ObjectPool::new();
        pool.reserve().unwrap();
        let mut called = false;
        assert_eq!(
            pool.construct_with(|| {
                called = true;
                1
            }),
            None
        );
        assert!(!called);
    }

    #[test]
    fn test_reserved_cell_has_no_reference() {
        let pool: ObjectPool<u32, 2> = ObjectPool::new();
        let index = pool.reserve().unwrap();

        assert_eq!(pool.slot_state(index), Some(SlotState::Reserved));
        assert!(pool.get(index).is_some());
        assert_eq!(unsafe { pool.get_ref(index) }, None);
        assert_eq!(pool.take(index), None);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_reserve_write_publish() {
        let pool: ObjectPool<u32, 2> = ObjectPool::new();
        let index = pool.reserve().unwrap();
        unsafe {
            pool.get(index).unwrap().as_ptr().write(99);
            assert!(pool.mark_constructed(index));
            assert!(!pool.mark_constructed(index));
            assert_eq!(pool.get_ref(index), Some(&99));
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool: ObjectPool<DropCounter, 4> = ObjectPool::new();
        let index = pool
            .construct(DropCounter(Arc::clone(&drops)))
            .ok()
            .unwrap();

        pool.remove(index, true);
        pool.remove(index, true);

        assert_eq!(pool.size(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(pool.slot_state(index), Some(SlotState::Empty));
        assert!(pool.get(index).is_none());
    }

    #[test]
    fn test_remove_without_destruct_skips_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool: ObjectPool<DropCounter, 2> = ObjectPool::new();
        let index = pool
            .construct(DropCounter(Arc::clone(&drops)))
            .ok()
            .unwrap();

        // Move the value out through the pointer, then free without dropping.
        let value = unsafe { pool.get(index).unwrap().as_ptr().read() };
        pool.remove(index, false);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(value);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_moves_value_out() {
        let pool: ObjectPool<String, 2> = ObjectPool::new();
        let index = pool.construct("hello".to_string()).unwrap();

        assert_eq!(pool.take(index), Some("hello".to_string()));
        assert_eq!(pool.take(index), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_cursor_moves_past_freed_cells() {
        let pool: ObjectPool<u8, 4> = ObjectPool::new();
        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        assert_eq!((a, b), (0, 1));

        pool.remove(a, false);
        assert_eq!(pool.reserve(), Some(2));
        assert_eq!(pool.reserve(), Some(3));
        // Wraps around to the freed cell
        assert_eq!(pool.reserve(), Some(0));
        assert_eq!(pool.reserve(), None);
    }

    #[test]
    fn test_pointer_index_round_trip() {
        let pool: ObjectPool<u64, 8> = ObjectPool::new();
        for index in 0..8 {
            let ptr = pool.index_to_pointer(index).unwrap();
            assert_eq!(pool.pointer_to_index(ptr.as_ptr()), Some(index));
        }
        assert!(pool.index_to_pointer(8).is_none());
    }

    #[test]
    fn test_pointer_to_index_rejects_foreign_pointers() {
        let pool: ObjectPool<u64, 4> = ObjectPool::new();
        let other: ObjectPool<u64, 4> = ObjectPool::new();
        let local = 5u64;

        let inside = pool.index_to_pointer(1).unwrap().as_ptr() as *const u8;
        let misaligned = unsafe { inside.add(1) } as *const u64;

        assert_eq!(pool.pointer_to_index(&local), None);
        assert_eq!(pool.pointer_to_index(misaligned), None);
        assert_eq!(
            pool.pointer_to_index(other.index_to_pointer(0).unwrap().as_ptr()),
            None
        );
    }

    #[test]
    fn test_pointer_api() {
        let pool: ObjectPool<String, 2> = ObjectPool::new();
        let a = pool.create("a".to_string()).unwrap();
        let b = pool.insert(&"b".to_string()).unwrap();
        assert!(pool.create_with(|| "c".to_string()).is_none());
        assert!(pool.allocate().is_none());

        assert_eq!(unsafe { a.as_ref() }, "a");
        pool.free(a);
        pool.free(a);
        assert_eq!(pool.size(), 1);

        let local = String::new();
        pool.free(NonNull::from(&local));
        assert_eq!(pool.size(), 1);

        pool.free(b);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_iter_skips_empty_cells() {
        let pool: ObjectPool<u32, 6> = ObjectPool::new();
        let indices: Vec<_> = (0..5).map(|i| pool.construct(i).unwrap()).collect();
        pool.remove(indices[1], true);
        pool.remove(indices[3], true);

        let live: Vec<usize> = pool.iter().map(|(index, _)| index).collect();
        assert_eq!(live, vec![0, 2, 4]);

        let values: Vec<u32> = pool
            .iter()
            .map(|(_, ptr)| unsafe { *ptr.as_ptr() })
            .collect();
        assert_eq!(values, vec![0, 2, 4]);
    }

    #[test]
    fn test_drop_destructs_constructed_only() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let pool: ObjectPool<DropCounter, 4> = ObjectPool::new();
            for _ in 0..3 {
                pool.construct(DropCounter(Arc::clone(&drops)))
                    .ok()
                    .unwrap();
            }
            pool.reserve().unwrap();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_capacity_pool() {
        let pool: ObjectPool<u32, 0> = ObjectPool::new();
        assert_eq!(pool.reserve(), None);
        assert_eq!(pool.construct(1), Err(1));
        assert_eq!(pool.pointer_to_index(std::ptr::null()), None);
        assert!(pool.is_full());
    }

    #[test]
    fn test_concurrent_claims_are_unique() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 16;

        let pool: Arc<ObjectPool<usize, { THREADS * PER_THREAD }>> = Arc::new(ObjectPool::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| pool.construct(t * PER_THREAD + i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();

        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert!(pool.is_full());
    }
}
