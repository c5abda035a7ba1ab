//! Shared memory substrate.
//!
//! Everything that more than one process touches lives in a memfd segment and
//! is addressed by index, never by pointer, because every process maps the
//! segment at its own base address.
//!
//! # Architecture
//!
//! - [`SharedMemorySegment`]: raw memfd mapping
//! - [`ShmRegion`]: one typed [`ShmSafe`] value in its own segment, behind a
//!   validated header
//! - [`SegmentManager`]: creates regions stamped with unique ids
//! - [`ObjectPool`]: fixed-capacity arena of cells addressed by index
//! - [`ipc`]: fd passing over Unix sockets
//!
//! # Example
//!
//! ```rust,ignore
//! use shoal::memory::{ObjectPool, SegmentManager, SegmentManagerConfig, ShmRegion};
//!
//! let manager = SegmentManager::new(SegmentManagerConfig::default());
//! let pool = manager.create_region("chunks", ObjectPool::<u64, 64>::new())?;
//!
//! // In the other process, after receiving the fd:
//! let view = unsafe { ShmRegion::<ObjectPool<u64, 64>>::open(fd)? };
//! let index = pool.construct(7).ok().unwrap();
//! assert!(view.get(index).is_some());
//! ```

pub mod ipc;
mod object_pool;
mod region;
mod shared;

pub use object_pool::{ObjectPool, SlotState};
pub use region::{SegmentManager, SegmentManagerConfig, ShmRegion, ShmSafe};
pub use shared::SharedMemorySegment;
