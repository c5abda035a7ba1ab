//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create spans for region creation.
    pub region_spans: bool,
    /// Whether to create spans for channel creation and discard.
    pub channel_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            region_spans: true,
            channel_spans: true,
        }
    }
}

impl TracingConfig {
    /// Enable every span.
    pub fn all() -> Self {
        Self {
            region_spans: true,
            channel_spans: true,
        }
    }

    /// Create a minimal config (region spans only).
    pub fn minimal() -> Self {
        Self {
            region_spans: true,
            channel_spans: false,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            region_spans: false,
            channel_spans: false,
        }
    }
}

/// Create a span for shared region setup.
///
/// # Example
///
/// ```rust,ignore
/// use shoal::observability::span_region;
///
/// let span = span_region("shoal-chunks");
/// let _guard = span.enter();
/// // Region creation here...
/// ```
#[inline]
pub fn span_region(name: &str) -> Span {
    span!(Level::DEBUG, "region", name = %name)
}

/// Create a span for work on the channel of `service`.
#[inline]
pub fn span_channel(service: &str) -> Span {
    span!(Level::DEBUG, "channel", service = %service)
}

/// Instrument channel work with tracing.
///
/// This is a convenience wrapper that enters a span and returns a guard.
pub fn instrument_channel(service: &str) -> tracing::span::EnteredSpan {
    span_channel(service).entered()
}

/// Log a notification being raised.
#[inline]
pub fn trace_notify(runtime: &str, index: usize) {
    tracing::trace!(runtime = %runtime, index, "notification raised");
}

/// Log a listener wakeup.
#[inline]
pub fn trace_wakeup(runtime: &str, notifications: &[usize]) {
    tracing::trace!(runtime = %runtime, ?notifications, "listener woke up");
}

/// Log a chunk evicted by queue overflow.
#[inline]
pub fn trace_chunk_lost(queue: &str, chunk: u32) {
    tracing::warn!(queue = %queue, chunk, "queue overflow, oldest chunk evicted");
}

/// Log a channel being created.
#[inline]
pub fn trace_channel_created(service: &str) {
    tracing::debug!(service = %service, "channel created");
}

/// Log a channel being discarded.
#[inline]
pub fn trace_channel_discarded(service: &str) {
    tracing::debug!(service = %service, "channel discarded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.region_spans);
        assert!(config.channel_spans);
    }

    #[test]
    fn test_tracing_config_all() {
        let config = TracingConfig::all();
        assert!(config.region_spans);
        assert!(config.channel_spans);
    }

    #[test]
    fn test_tracing_config_minimal() {
        let config = TracingConfig::minimal();
        assert!(config.region_spans);
        assert!(!config.channel_spans);
    }

    #[test]
    fn test_tracing_config_none() {
        let config = TracingConfig::none();
        assert!(!config.region_spans);
        assert!(!config.channel_spans);
    }

    #[test]
    fn test_span_creation() {
        // These should not panic
        let _span = span_region("test-region");
        let _span = span_channel("radar/front/objects");
        let _guard = instrument_channel("radar/front/objects");
    }

    #[test]
    fn test_trace_functions() {
        // These should not panic even without a subscriber
        trace_notify("test", 3);
        trace_wakeup("test", &[1, 2]);
        trace_chunk_lost("queue", 7);
        trace_channel_created("svc");
        trace_channel_discarded("svc");
    }
}
