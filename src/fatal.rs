//! Process-wide channel for unrecoverable errors.
//!
//! Some failures cannot be handled by the caller that observes them: a
//! semaphore in shared memory that refuses a post means the synchronization
//! state seen by *other* processes may already be inconsistent. Such errors
//! are reported here instead of being returned.
//!
//! The default handler logs the error and aborts the process. Embedders and
//! tests can install their own handler with [`set_fatal_handler`].

use crate::sync::SemaphoreError;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// An unrecoverable error in shared synchronization state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Posting a condition variable's semaphore failed.
    #[error("semaphore post failed for condition variable of '{runtime}': {source}")]
    SemaphorePost {
        /// Runtime that owns the condition variable.
        runtime: String,
        /// Underlying semaphore failure.
        source: SemaphoreError,
    },

    /// Blocking on a condition variable's semaphore failed.
    #[error("semaphore wait failed for condition variable of '{runtime}': {source}")]
    SemaphoreWait {
        /// Runtime that owns the condition variable.
        runtime: String,
        /// Underlying semaphore failure.
        source: SemaphoreError,
    },

    /// Draining a condition variable's semaphore failed.
    #[error("semaphore reset failed for condition variable of '{runtime}': {source}")]
    SemaphoreReset {
        /// Runtime that owns the condition variable.
        runtime: String,
        /// Underlying semaphore failure.
        source: SemaphoreError,
    },
}

/// Callback invoked for every fatal error.
pub type FatalHandler = Arc<dyn Fn(&FatalError) + Send + Sync>;

static HANDLER: RwLock<Option<FatalHandler>> = RwLock::new(None);

/// Install a process-wide fatal error handler.
///
/// The previous handler is restored when the returned guard is dropped.
/// A handler that returns lets the reporting operation continue on a best
/// effort basis.
#[must_use = "the handler is uninstalled when the guard is dropped"]
pub fn set_fatal_handler<F>(handler: F) -> FatalHandlerGuard
where
    F: Fn(&FatalError) + Send + Sync + 'static,
{
    let mut slot = HANDLER.write().unwrap_or_else(PoisonError::into_inner);
    let previous = slot.replace(Arc::new(handler));
    FatalHandlerGuard { previous }
}

/// Restores the previously installed fatal handler on drop.
pub struct FatalHandlerGuard {
    previous: Option<FatalHandler>,
}

impl Drop for FatalHandlerGuard {
    fn drop(&mut self) {
        let mut slot = HANDLER.write().unwrap_or_else(PoisonError::into_inner);
        *slot = self.previous.take();
    }
}

/// Report a fatal error to the installed handler.
pub(crate) fn report(error: FatalError) {
    tracing::error!(error = %error, "fatal error in shared synchronization state");

    let handler = HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    match handler {
        Some(handler) => handler(&error),
        None => std::process::abort(),
    }
}

/// Serializes tests that install a fatal handler.
#[cfg(test)]
pub(crate) static TEST_HANDLER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
