//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! The lock-free primitives ([`SoFi`](crate::concurrent::SoFi),
//! [`ObjectPool`](crate::memory::ObjectPool)) record nothing; the queue,
//! listener and gateway layers built on them do.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `shoal_chunks_pushed` | Counter | Chunk indices pushed to queues |
//! | `shoal_chunks_popped` | Counter | Chunk indices popped from queues |
//! | `shoal_chunks_lost` | Counter | Chunk indices evicted by overflow |
//! | `shoal_notifications` | Counter | Notifications raised by producers |
//! | `shoal_wakeups` | Counter | Listener wakeups with notifications |
//! | `shoal_pool_exhausted` | Counter | Allocations rejected by a full pool |
//! | `shoal_channels_created` | Counter | Gateway channels created |
//! | `shoal_channels_discarded` | Counter | Gateway channels discarded |
//! | `shoal_queue_depth` | Gauge | Chunk indices pending in a queue |
//! | `shoal_wait_time_ns` | Histogram | Listener wait time |
//!
//! ## Example
//!
//! ```rust,ignore
//! use shoal::observability::init_metrics;
//!
//! // Initialize metrics (call once at startup)
//! init_metrics();
//!
//! // Use a metrics exporter (prometheus, statsd, etc.) to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    QueueMetrics, init_metrics, record_channel_created, record_channel_discarded,
    record_pool_exhausted, record_wakeup,
};
pub use tracing_support::{
    TracingConfig, instrument_channel, span_channel, span_region, trace_channel_created,
    trace_channel_discarded, trace_chunk_lost, trace_notify, trace_wakeup,
};
