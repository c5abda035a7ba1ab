//! Typed placement of shared structures in memfd segments.
//!
//! A [`ShmRegion<T>`] holds exactly one `T` in its own shared memory segment,
//! behind a small header that lets a second process validate what it mapped
//! before touching it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ RegionHeader (64 bytes, cache-line aligned)                     │
//! │ ┌─────────────────────────────────────────────────────────────┐ │
//! │ │ magic: u64          │ version: u32  │ data_offset: u32      │ │
//! │ │ type_size: u64      │ type_align: u64                       │ │
//! │ │ type_fingerprint: u64                                       │ │
//! │ │ region_id: u64                                              │ │
//! │ └─────────────────────────────────────────────────────────────┘ │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ T (aligned to align_of::<T>())                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The owner writes the value and the header fields first and publishes the
//! magic number last, with release ordering. A client that observes the magic
//! with acquire ordering therefore observes a fully initialized `T`.

use super::SharedMemorySegment;
use crate::defaults::{DEFAULT_SEGMENT_PREFIX, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::id::{UniqueId, UniqueIdCounter};
use crate::observability::{TracingConfig, span_region};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
    Ordering,
};

/// Magic number to identify valid region headers.
const REGION_MAGIC: u64 = 0x5348_4F41_4C5F_5247; // "SHOAL_RG" in ASCII

/// Current region format version.
const REGION_VERSION: u32 = 1;

/// Types that may live in memory mapped by several processes.
///
/// # Safety
///
/// Implementors guarantee that:
/// - the type contains no pointers or references into process-local memory
///   (every cross-object reference is an index or offset), so it stays valid
///   when mapped at a different base address;
/// - all state shared between processes is mutated either through atomics or
///   through cells whose access protocol the type documents;
/// - its layout is fixed (`#[repr(C)]` or a primitive).
pub unsafe trait ShmSafe: Sync {}

macro_rules! impl_shm_safe {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: plain values or atomics without pointers.
            unsafe impl ShmSafe for $ty {}
        )*
    };
}

impl_shm_safe!(
    u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, bool, AtomicBool, AtomicU8,
    AtomicU16, AtomicU32, AtomicU64, AtomicUsize, AtomicI32, AtomicI64,
);

// SAFETY: an array of ShmSafe elements has no additional state.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// Header at the start of every region (in shared memory).
#[repr(C, align(64))]
struct RegionHeader {
    /// Magic number, written last.
    magic: AtomicU64,
    /// Format version.
    version: AtomicU32,
    /// Offset from segment base to the value.
    data_offset: AtomicU32,
    /// `size_of::<T>()` of the creator.
    type_size: AtomicU64,
    /// `align_of::<T>()` of the creator.
    type_align: AtomicU64,
    /// Hash of the creator's type name, size and alignment.
    type_fingerprint: AtomicU64,
    /// Id stamped by the creator.
    region_id: AtomicU64,
}

impl RegionHeader {
    /// Validate the header against the type `T` the caller expects.
    fn validate<T>(&self, segment_len: usize) -> Result<()> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != REGION_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "invalid region magic: expected {:x}, got {:x}",
                REGION_MAGIC, magic
            )));
        }
        let version = self.version.load(Ordering::Acquire);
        if version != REGION_VERSION {
            return Err(Error::InvalidSegment(format!(
                "unsupported region version: expected {}, got {}",
                REGION_VERSION, version
            )));
        }
        let fingerprint = self.type_fingerprint.load(Ordering::Acquire);
        if fingerprint != type_fingerprint::<T>()
            || self.type_size.load(Ordering::Acquire) != std::mem::size_of::<T>() as u64
            || self.type_align.load(Ordering::Acquire) != std::mem::align_of::<T>() as u64
        {
            return Err(Error::InvalidSegment(format!(
                "region does not hold a {}",
                std::any::type_name::<T>()
            )));
        }
        let data_offset = self.data_offset.load(Ordering::Acquire) as usize;
        if data_offset != data_offset_for::<T>() || data_offset + std::mem::size_of::<T>() > segment_len
        {
            return Err(Error::InvalidSegment(format!(
                "region layout mismatch: data offset {} in a {} byte segment",
                data_offset, segment_len
            )));
        }
        Ok(())
    }
}

/// FNV-1a over the type name, size and alignment.
///
/// Only processes built from the same source can share a region, so the type
/// name is a sufficient discriminator.
fn type_fingerprint<T>() -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let size = std::mem::size_of::<T>() as u64;
    let align = std::mem::align_of::<T>() as u64;
    std::any::type_name::<T>()
        .bytes()
        .chain(size.to_le_bytes())
        .chain(align.to_le_bytes())
        .fold(FNV_OFFSET, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
}

/// Offset of the value behind the header.
fn data_offset_for<T>() -> usize {
    let align = std::mem::align_of::<T>();
    (std::mem::size_of::<RegionHeader>() + align - 1) & !(align - 1)
}

/// One `T` placed in its own shared memory segment.
///
/// The creating process is the *owner*: it initializes the value and runs its
/// destructor when the region is dropped. Other processes *open* the region
/// from a received fd and get shared access only.
///
/// # Example
///
/// ```rust,ignore
/// use shoal::memory::ShmRegion;
/// use shoal::concurrent::SoFi;
/// use shoal::id::UniqueId;
///
/// let region = ShmRegion::create("queue", UniqueId::from_raw(1), SoFi::<u32, 8>::new())?;
/// let fd = region.try_clone_fd()?;
/// // ...send fd to the consumer process...
/// let view = unsafe { ShmRegion::<SoFi<u32, 8>>::open(fd)? };
/// region.push(7);
/// assert_eq!(view.pop(), Some(7));
/// ```
pub struct ShmRegion<T: ShmSafe> {
    segment: SharedMemorySegment,
    value: NonNull<T>,
    id: UniqueId,
    is_owner: bool,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe> ShmRegion<T> {
    /// Create a region holding `value` (owner process).
    pub fn create(name: &str, id: UniqueId, value: T) -> Result<Self> {
        let align = std::mem::align_of::<T>();
        if align > PAGE_SIZE {
            return Err(Error::AllocationFailed(format!(
                "alignment {} exceeds page size",
                align
            )));
        }

        let data_offset = data_offset_for::<T>();
        let total_size = data_offset + std::mem::size_of::<T>();
        let segment = SharedMemorySegment::new(name, total_size)?;

        let base = segment.as_ptr();
        // SAFETY: the segment is at least `total_size` bytes, page aligned, and
        // not yet visible to anyone else.
        let value_ptr = unsafe {
            let value_ptr = base.add(data_offset).cast::<T>();
            value_ptr.write(value);
            NonNull::new_unchecked(value_ptr)
        };

        // SAFETY: base is page aligned and the header fits before data_offset.
        let header = unsafe { &*base.cast::<RegionHeader>() };
        header.version.store(REGION_VERSION, Ordering::Relaxed);
        header.data_offset.store(data_offset as u32, Ordering::Relaxed);
        header
            .type_size
            .store(std::mem::size_of::<T>() as u64, Ordering::Relaxed);
        header.type_align.store(align as u64, Ordering::Relaxed);
        header
            .type_fingerprint
            .store(type_fingerprint::<T>(), Ordering::Relaxed);
        header.region_id.store(id.as_raw(), Ordering::Relaxed);
        header.magic.store(REGION_MAGIC, Ordering::Release);

        tracing::debug!(
            region = %name,
            id = %id,
            size = total_size,
            ty = std::any::type_name::<T>(),
            "created shared region"
        );

        Ok(Self {
            segment,
            value: value_ptr,
            id,
            is_owner: true,
            _marker: PhantomData,
        })
    }

    /// Map an existing region from a received file descriptor (client process).
    ///
    /// The header is validated against `T` before the value is exposed.
    ///
    /// # Safety
    ///
    /// `fd` must refer to a region created by [`create`](Self::create) in a
    /// process built from the same source, and the owner must keep the value
    /// alive for as long as this mapping uses it.
    pub unsafe fn open(fd: OwnedFd) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let segment = unsafe { SharedMemorySegment::from_fd(fd, None)? };
        if segment.len() < std::mem::size_of::<RegionHeader>() {
            return Err(Error::InvalidSegment("segment too small for header".into()));
        }

        let base = segment.as_ptr();
        // SAFETY: the mapping is page aligned and large enough for the header.
        let header = unsafe { &*base.cast::<RegionHeader>() };
        header.validate::<T>(segment.len())?;

        let id = UniqueId::from_raw(header.region_id.load(Ordering::Acquire));
        let data_offset = header.data_offset.load(Ordering::Acquire) as usize;
        // SAFETY: validated above: offset + size_of::<T>() lies within the segment.
        let value = unsafe { NonNull::new_unchecked(base.add(data_offset).cast::<T>()) };

        tracing::debug!(
            id = %id,
            size = segment.len(),
            ty = std::any::type_name::<T>(),
            "opened shared region"
        );

        Ok(Self {
            segment,
            value,
            id,
            is_owner: false,
            _marker: PhantomData,
        })
    }

    /// Exclusive access to the value.
    ///
    /// # Safety
    ///
    /// No other mapping of this region (in this or any other process) may
    /// access the value while the returned reference is alive.
    pub unsafe fn as_mut_unchecked(&mut self) -> &mut T {
        // SAFETY: exclusivity across mappings is the caller's obligation,
        // exclusivity within this mapping follows from &mut self.
        unsafe { self.value.as_mut() }
    }

    /// The id stamped into the header by the creator.
    #[inline]
    pub fn id(&self) -> UniqueId {
        self.id
    }

    /// Whether this process created the region.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Borrow the region's fd.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.segment.as_fd()
    }

    /// Duplicate the region's fd, e.g. to send it to another process.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        self.segment.try_clone_fd()
    }

    /// Address of the value in this process's mapping.
    ///
    /// Differs between processes (and between two mappings in one process);
    /// never store or transmit it.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.value.as_ptr() as usize
    }

    /// The backing segment.
    pub fn segment(&self) -> &SharedMemorySegment {
        &self.segment
    }
}

impl<T: ShmSafe> Deref for ShmRegion<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the value was initialized by the owner (validated by the
        // header for clients) and lives as long as the mapping.
        unsafe { self.value.as_ref() }
    }
}

impl<T: ShmSafe> AsFd for ShmRegion<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.segment.as_fd()
    }
}

impl<T: ShmSafe> Drop for ShmRegion<T> {
    fn drop(&mut self) {
        if self.is_owner {
            // SAFETY: the owner initialized the value and drops it exactly once.
            unsafe { std::ptr::drop_in_place(self.value.as_ptr()) };
        }
        // segment unmaps itself
    }
}

// SAFETY: the region only hands out &T (T: Sync via ShmSafe); dropping the
// value on another thread requires T: Send.
unsafe impl<T: ShmSafe + Send> Send for ShmRegion<T> {}
unsafe impl<T: ShmSafe> Sync for ShmRegion<T> {}

/// Configuration for a [`SegmentManager`].
#[derive(Debug, Clone)]
pub struct SegmentManagerConfig {
    /// Prefix prepended to every memfd name.
    pub name_prefix: String,
    /// Touch every page of new regions before returning them.
    pub prefault: bool,
    /// Which spans to create.
    pub tracing: TracingConfig,
}

impl Default for SegmentManagerConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_SEGMENT_PREFIX.to_string(),
            prefault: false,
            tracing: TracingConfig::default(),
        }
    }
}

impl SegmentManagerConfig {
    /// Set the memfd name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Enable or disable prefaulting.
    pub fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Set the tracing configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

/// Hands out shared regions stamped with unique ids.
///
/// This is the allocator role of a broker: it owns the id counter and the
/// naming policy, and logs every region it creates.
#[derive(Debug, Default)]
pub struct SegmentManager {
    config: SegmentManagerConfig,
    ids: UniqueIdCounter,
}

impl SegmentManager {
    /// Create a manager with the given configuration.
    pub fn new(config: SegmentManagerConfig) -> Self {
        Self {
            config,
            ids: UniqueIdCounter::new(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SegmentManagerConfig {
        &self.config
    }

    /// Create a region holding `value`.
    pub fn create_region<T: ShmSafe>(&self, name: &str, value: T) -> Result<ShmRegion<T>> {
        let full_name = format!("{}-{}", self.config.name_prefix, name);
        let _span = self
            .config
            .tracing
            .region_spans
            .then(|| span_region(&full_name).entered());

        let region = ShmRegion::create(&full_name, self.ids.next(), value)?;
        if self.config.prefault {
            region.segment().prefault();
        }
        Ok(region)
    }

    /// Open a region received from another process.
    ///
    /// # Safety
    ///
    /// See [`ShmRegion::open`].
    pub unsafe fn open_region<T: ShmSafe>(&self, fd: OwnedFd) -> Result<ShmRegion<T>> {
        unsafe { ShmRegion::open(fd) }
    }
}
