//! # Shoal
//!
//! The concurrency core of a zero-copy shared-memory IPC middleware.
//!
//! Processes exchange data by writing payloads into cells of a shared
//! [`ObjectPool`](memory::ObjectPool) and passing the cell *indices* through
//! lock-free queues, never copying payloads through the kernel and never
//! sharing raw pointers (every process maps shared memory at its own base
//! address).
//!
//! ## Building blocks
//!
//! - **Object pool**: fixed-capacity arena of cells addressed by index, with
//!   O(1) index/pointer translation
//! - **SoFi**: single-producer/single-consumer ring buffer that evicts and
//!   returns the oldest element instead of rejecting a push
//! - **Condition variable trio**: many [`Notifier`](sync::Notifier)s raising
//!   flags that one [`Listener`](sync::Listener) collects, with explicit
//!   destroy for shutdown
//! - **Channel pairing**: per-service pairs of pooled terminals for gateways
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shoal::prelude::*;
//!
//! let manager = SegmentManager::new(SegmentManagerConfig::default());
//! let pool = manager.create_region("chunks", ObjectPool::<[u8; 64], 4>::new())?;
//! let queue = manager.create_region("queue", ChunkQueueData::<16>::new())?;
//! let condition = manager.create_region("wakeup", ConditionVariableData::new("app")?)?;
//!
//! // Producer
//! let index = pool.construct([7; 64]).ok().unwrap();
//! let mut pusher = ChunkQueuePusher::new(&queue, "chunks");
//! pusher.attach_notifier(Notifier::new(&condition, 0)?);
//! pusher.push(index as u32);
//!
//! // Consumer (typically another process that opened the regions by fd)
//! let listener = Listener::new(&condition);
//! for _ in listener.wait() {
//!     let popper = ChunkQueuePopper::new(&queue, "chunks");
//!     while let Some(index) = popper.pop() {
//!         pool.remove(index as usize, true);
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod concurrent;
pub mod defaults;
pub mod error;
pub mod fatal;
pub mod gateway;
pub mod id;
pub mod memory;
pub mod observability;
pub mod queue;
pub mod sync;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::concurrent::{SoFi, SoFiValue};
    pub use crate::error::{Error, Result};
    pub use crate::gateway::{Channel, ChannelRegistry, ServiceDescription, Terminal, TerminalPools};
    pub use crate::id::{UniqueId, UniqueIdCounter};
    pub use crate::memory::{
        ObjectPool, SegmentManager, SegmentManagerConfig, ShmRegion, ShmSafe,
    };
    pub use crate::queue::{ChunkQueueData, ChunkQueuePopper, ChunkQueuePusher};
    pub use crate::sync::{ConditionVariableData, Listener, Notifier};
}

pub use error::{Error, Result};
