//! Capacity limits and configuration constants.
//!
//! Every structure that lives in shared memory has a fixed layout, so its
//! capacities are compile-time constants shared by all participating
//! processes. Processes built with different values must not share memory.

// =============================================================================
// Condition Variable
// =============================================================================

/// Number of notification slots in one condition variable.
///
/// Each [`Notifier`](crate::sync::Notifier) attached to a condition variable
/// owns one slot, so this is also the fan-in limit of a single listener.
pub const MAX_NUMBER_OF_NOTIFIERS: usize = 256;

/// Capacity in bytes of the runtime name tag stored in shared structures.
pub const MAX_RUNTIME_NAME_LENGTH: usize = 100;

// =============================================================================
// Queues
// =============================================================================

/// Default capacity for chunk queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// Gateway
// =============================================================================

/// Maximum number of channels a registry can hold, and the default terminal
/// pool capacity.
pub const MAX_CHANNEL_NUMBER: usize = 128;

// =============================================================================
// Shared Memory
// =============================================================================

/// Prefix used for memfd names created by the segment manager.
pub const DEFAULT_SEGMENT_PREFIX: &str = "shoal";

/// Page size assumed when prefaulting segments.
pub const PAGE_SIZE: usize = 4096;

/// Cache line size used for padding hot atomics.
pub const CACHE_LINE_SIZE: usize = 64;
