//! Chunk queues: SoFi-backed delivery of pool indices between processes.
//!
//! A producer loans a cell from an [`ObjectPool`](crate::memory::ObjectPool),
//! writes the payload, and pushes the cell's index through a
//! [`ChunkQueuePusher`]. The consumer pops indices with a
//! [`ChunkQueuePopper`], reads the payload and removes the cell.
//!
//! When the queue overflows the oldest index is evicted and handed back to
//! the producer, which must release that cell itself; the queue remembers
//! the loss so the consumer can find out.
//!
//! ```text
//!  producer                       shared memory                    consumer
//! ┌──────────┐ push(idx) ┌───────────────────────────┐ pop() ┌──────────┐
//! │  Pusher  │──────────►│ ChunkQueueData            │──────►│  Popper  │
//! │          │◄──────────│  SoFi<u32, C> + lost flag │       │          │
//! └────┬─────┘  evicted  └───────────────────────────┘       └────▲─────┘
//!      │ notify                                                   │ wait
//!      └───────────────────► ConditionVariableData ───────────────┘
//! ```

use crate::concurrent::SoFi;
use crate::defaults::DEFAULT_QUEUE_CAPACITY;
use crate::memory::ShmSafe;
use crate::observability::{QueueMetrics, trace_chunk_lost};
use crate::sync::Notifier;
use std::sync::atomic::{AtomicBool, Ordering};

/// Chunk queue with the default capacity.
pub type DefaultChunkQueueData = ChunkQueueData<DEFAULT_QUEUE_CAPACITY>;

/// Shared state of one chunk queue.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkQueueData<const CAPACITY: usize> {
    queue: SoFi<u32, CAPACITY>,
    has_lost_chunks: AtomicBool,
}

impl<const CAPACITY: usize> ChunkQueueData<CAPACITY> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            queue: SoFi::new(),
            has_lost_chunks: AtomicBool::new(false),
        }
    }

    /// Reduce the active capacity of an empty queue.
    ///
    /// See [`SoFi::set_capacity`].
    pub fn set_capacity(&mut self, capacity: usize) -> bool {
        self.queue.set_capacity(capacity)
    }
}

impl<const CAPACITY: usize> Default for ChunkQueueData<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: a SoFi of u32 plus an atomic flag.
unsafe impl<const CAPACITY: usize> ShmSafe for ChunkQueueData<CAPACITY> {}

/// Producer side of a chunk queue.
#[derive(Debug)]
pub struct ChunkQueuePusher<'a, const CAPACITY: usize> {
    data: &'a ChunkQueueData<CAPACITY>,
    notifier: Option<Notifier<'a>>,
    metrics: QueueMetrics,
}

impl<'a, const CAPACITY: usize> ChunkQueuePusher<'a, CAPACITY> {
    /// Create the producer side of `data`; `name` labels logs and metrics.
    pub fn new(data: &'a ChunkQueueData<CAPACITY>, name: &str) -> Self {
        Self {
            data,
            notifier: None,
            metrics: QueueMetrics::new(name),
        }
    }

    /// Notify through `notifier` after every push.
    pub fn attach_notifier(&mut self, notifier: Notifier<'a>) {
        self.notifier = Some(notifier);
    }

    /// Push a chunk index.
    ///
    /// Returns the evicted index if the queue was full; the caller owns that
    /// chunk again and must release it to its pool.
    pub fn push(&self, chunk: u32) -> Option<u32> {
        let evicted = self.data.queue.push(chunk);
        if let Some(lost) = evicted {
            self.data.has_lost_chunks.store(true, Ordering::Relaxed);
            self.metrics.record_lost();
            trace_chunk_lost(self.metrics.queue(), lost);
        }
        self.metrics.record_push(self.data.queue.size());

        if let Some(notifier) = &self.notifier {
            notifier.notify();
            self.metrics.record_notification();
        }
        evicted
    }
}

/// Consumer side of a chunk queue.
#[derive(Debug)]
pub struct ChunkQueuePopper<'a, const CAPACITY: usize> {
    data: &'a ChunkQueueData<CAPACITY>,
    metrics: QueueMetrics,
}

impl<'a, const CAPACITY: usize> ChunkQueuePopper<'a, CAPACITY> {
    /// Create the consumer side of `data`; `name` labels logs and metrics.
    pub fn new(data: &'a ChunkQueueData<CAPACITY>, name: &str) -> Self {
        Self {
            data,
            metrics: QueueMetrics::new(name),
        }
    }

    /// Pop the oldest chunk index.
    pub fn pop(&self) -> Option<u32> {
        let chunk = self.data.queue.pop()?;
        self.metrics.record_pop(self.data.queue.size());
        Some(chunk)
    }

    /// Whether chunks were evicted since the last call. Resets the flag.
    pub fn has_lost_chunks(&self) -> bool {
        self.data.has_lost_chunks.swap(false, Ordering::Relaxed)
    }

    /// Number of queued chunks (snapshot).
    pub fn size(&self) -> usize {
        self.data.queue.size()
    }

    /// Returns true if no chunk is queued (snapshot).
    pub fn is_empty(&self) -> bool {
        self.data.queue.is_empty()
    }

    /// Active capacity.
    pub fn capacity(&self) -> usize {
        self.data.queue.capacity()
    }

    /// Drain the queue, handing every index to `release`.
    pub fn clear<F>(&self, mut release: F)
    where
        F: FnMut(u32),
    {
        while let Some(chunk) = self.pop() {
            release(chunk);
        }
    }
}
