//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const CHUNKS_PUSHED: &str = "shoal_chunks_pushed";
const CHUNKS_POPPED: &str = "shoal_chunks_popped";
const CHUNKS_LOST: &str = "shoal_chunks_lost";
const NOTIFICATIONS: &str = "shoal_notifications";
const WAKEUPS: &str = "shoal_wakeups";
const POOL_EXHAUSTED: &str = "shoal_pool_exhausted";
const CHANNELS_CREATED: &str = "shoal_channels_created";
const CHANNELS_DISCARDED: &str = "shoal_channels_discarded";
const QUEUE_DEPTH: &str = "shoal_queue_depth";
const WAIT_TIME_NS: &str = "shoal_wait_time_ns";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(CHUNKS_PUSHED, Unit::Count, "Chunk indices pushed to queues");
    metrics::describe_counter!(CHUNKS_POPPED, Unit::Count, "Chunk indices popped from queues");
    metrics::describe_counter!(
        CHUNKS_LOST,
        Unit::Count,
        "Chunk indices evicted by queue overflow"
    );
    metrics::describe_counter!(
        NOTIFICATIONS,
        Unit::Count,
        "Notifications raised by queue producers"
    );
    metrics::describe_counter!(WAKEUPS, Unit::Count, "Listener wakeups with notifications");
    metrics::describe_counter!(
        POOL_EXHAUSTED,
        Unit::Count,
        "Allocations rejected by a full object pool"
    );
    metrics::describe_counter!(CHANNELS_CREATED, Unit::Count, "Gateway channels created");
    metrics::describe_counter!(
        CHANNELS_DISCARDED,
        Unit::Count,
        "Gateway channels discarded"
    );
    metrics::describe_gauge!(QUEUE_DEPTH, Unit::Count, "Chunk indices pending in a queue");
    metrics::describe_histogram!(
        WAIT_TIME_NS,
        Unit::Nanoseconds,
        "Time a listener spent waiting for notifications"
    );
}

/// Record a listener wakeup that returned `notifications` indices.
#[inline]
pub fn record_wakeup(runtime: &str, notifications: usize, waited: Duration) {
    counter!(WAKEUPS, "runtime" => runtime.to_string()).increment(1);
    histogram!(WAIT_TIME_NS, "runtime" => runtime.to_string()).record(waited.as_nanos() as f64);
    tracing::trace!(runtime = %runtime, notifications, "wakeup recorded");
}

/// Record an allocation rejected by a full pool.
#[inline]
pub fn record_pool_exhausted(pool: &str) {
    counter!(POOL_EXHAUSTED, "pool" => pool.to_string()).increment(1);
}

/// Record a channel created for `service`.
#[inline]
pub fn record_channel_created(service: &str) {
    counter!(CHANNELS_CREATED, "service" => service.to_string()).increment(1);
}

/// Record a channel discarded for `service`.
#[inline]
pub fn record_channel_discarded(service: &str) {
    counter!(CHANNELS_DISCARDED, "service" => service.to_string()).increment(1);
}

/// Metrics collector for one chunk queue endpoint.
///
/// Provides a convenient way to record metrics with pre-configured labels.
#[derive(Clone)]
pub struct QueueMetrics {
    queue: String,
    pushed: Counter,
    popped: Counter,
    lost: Counter,
    notifications: Counter,
    depth: Gauge,
}

impl QueueMetrics {
    /// Create a collector labelled with `queue`.
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            pushed: counter!(CHUNKS_PUSHED, "queue" => queue.to_string()),
            popped: counter!(CHUNKS_POPPED, "queue" => queue.to_string()),
            lost: counter!(CHUNKS_LOST, "queue" => queue.to_string()),
            notifications: counter!(NOTIFICATIONS, "queue" => queue.to_string()),
            depth: gauge!(QUEUE_DEPTH, "queue" => queue.to_string()),
        }
    }

    /// Record a push leaving `depth` chunks queued.
    #[inline]
    pub fn record_push(&self, depth: usize) {
        self.pushed.increment(1);
        self.depth.set(depth as f64);
    }

    /// Record a pop leaving `depth` chunks queued.
    #[inline]
    pub fn record_pop(&self, depth: usize) {
        self.popped.increment(1);
        self.depth.set(depth as f64);
    }

    /// Record an evicted chunk.
    #[inline]
    pub fn record_lost(&self) {
        self.lost.increment(1);
    }

    /// Record a notification raised after a push.
    #[inline]
    pub fn record_notification(&self) {
        self.notifications.increment(1);
    }

    /// Get the queue label.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
