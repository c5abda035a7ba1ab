//! Cross-process synchronization.
//!
//! - [`InterprocessSemaphore`]: counting semaphore on a shared futex word
//! - [`ConditionVariableData`], [`Notifier`], [`Listener`]: many-to-one
//!   notification with coalescing and explicit shutdown

mod condition;
mod futex;
mod semaphore;

pub use condition::{ConditionVariableData, Listener, NotificationVec, Notifier, RuntimeName};
pub use semaphore::{InterprocessSemaphore, SEM_VALUE_MAX, SemaphoreError};
