//! Error types for shoal.

use crate::gateway::ChannelError;
use crate::sync::SemaphoreError;
use thiserror::Error;

/// Result type alias using shoal's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shoal operations.
///
/// Capacity exhaustion inside the lock-free primitives is reported through
/// `Option` sentinels, not through this type. Timeouts are never errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid shared memory segment or region header.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// A notifier was requested for an index outside the condition variable.
    #[error("notifier index {index} out of range [0, {max})")]
    NotifierIndexOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of notification slots.
        max: usize,
    },

    /// A fixed-capacity name was too long.
    #[error("name '{name}' exceeds {max} bytes")]
    NameTooLong {
        /// The rejected name.
        name: String,
        /// Capacity in bytes.
        max: usize,
    },

    /// Channel creation or lookup failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Semaphore operation failed.
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotifierIndexOutOfRange {
            index: 300,
            max: 256,
        };
        assert_eq!(err.to_string(), "notifier index 300 out of range [0, 256)");

        let err = Error::from(ChannelError::ObjectPoolFull);
        assert!(matches!(err, Error::Channel(ChannelError::ObjectPoolFull)));
    }
}
