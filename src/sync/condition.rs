//! Condition variable in shared memory: many notifiers, one listener.
//!
//! [`ConditionVariableData`] is the shared part: one flag per notification
//! index plus a semaphore. Each [`Notifier`] owns one index and raises its
//! flag before posting the semaphore. A [`Listener`] drains the semaphore,
//! collects every raised flag in index order and only blocks if none was
//! raised.
//!
//! Notifications are coalesced: any number of `notify` calls on one index
//! between two waits show up once, and notifications on different indices
//! issued before a wait are all returned by that single wait.
//!
//! # Example
//!
//! ```rust,ignore
//! use shoal::sync::{ConditionVariableData, Listener, Notifier};
//!
//! let data = ConditionVariableData::new("subscriber-app")?;
//! let listener = Listener::new(&data);
//!
//! Notifier::new(&data, 3)?.notify();
//! Notifier::new(&data, 1)?.notify();
//!
//! assert_eq!(listener.wait().as_slice(), &[1, 3]);
//! ```

use super::semaphore::InterprocessSemaphore;
use crate::defaults::{MAX_NUMBER_OF_NOTIFIERS, MAX_RUNTIME_NAME_LENGTH};
use crate::error::{Error, Result};
use crate::fatal::{self, FatalError};
use crate::memory::ShmSafe;
use crate::observability::{record_wakeup, trace_notify, trace_wakeup};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Indices returned by one wakeup, sorted and without duplicates.
pub type NotificationVec = SmallVec<[usize; 16]>;

/// Fixed-capacity UTF-8 name stored inline, so it can live in shared memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuntimeName {
    len: u8,
    bytes: [u8; MAX_RUNTIME_NAME_LENGTH],
}

impl RuntimeName {
    /// Copy `name` into a fixed buffer.
    ///
    /// Fails with [`Error::NameTooLong`] if `name` exceeds
    /// [`MAX_RUNTIME_NAME_LENGTH`] bytes.
    pub fn new(name: &str) -> Result<Self> {
        if name.len() > MAX_RUNTIME_NAME_LENGTH {
            return Err(Error::NameTooLong {
                name: name.to_string(),
                max: MAX_RUNTIME_NAME_LENGTH,
            });
        }
        let mut bytes = [0u8; MAX_RUNTIME_NAME_LENGTH];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            len: name.len() as u8,
            bytes,
        })
    }

    /// The name as a string slice.
    ///
    /// A name corrupted in shared memory reads as `"<invalid>"`.
    pub fn as_str(&self) -> &str {
        let len = (self.len as usize).min(MAX_RUNTIME_NAME_LENGTH);
        std::str::from_utf8(&self.bytes[..len]).unwrap_or("<invalid>")
    }
}

impl fmt::Display for RuntimeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for RuntimeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RuntimeName").field(&self.as_str()).finish()
    }
}

impl PartialEq for RuntimeName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for RuntimeName {}

// SAFETY: plain bytes, written once before the structure is shared.
unsafe impl ShmSafe for RuntimeName {}

/// Shared state of a condition variable.
///
/// `#[repr(C)]` and pointer free; place it in a
/// [`ShmRegion`](crate::memory::ShmRegion) to share it between processes.
#[repr(C)]
pub struct ConditionVariableData {
    semaphore: InterprocessSemaphore,
    runtime_name: RuntimeName,
    to_be_destroyed: AtomicBool,
    was_notified: AtomicBool,
    active_notifications: [AtomicBool; MAX_NUMBER_OF_NOTIFIERS],
}

impl ConditionVariableData {
    /// Create condition variable state owned by `runtime_name`.
    pub fn new(runtime_name: &str) -> Result<Self> {
        Ok(Self {
            semaphore: InterprocessSemaphore::new(0),
            runtime_name: RuntimeName::new(runtime_name)?,
            to_be_destroyed: AtomicBool::new(false),
            was_notified: AtomicBool::new(false),
            active_notifications: [const { AtomicBool::new(false) }; MAX_NUMBER_OF_NOTIFIERS],
        })
    }

    /// Name of the runtime that owns this condition variable.
    pub fn runtime_name(&self) -> &RuntimeName {
        &self.runtime_name
    }

    /// Whether any notifier fired since the listener last started waiting.
    ///
    /// Diagnostic only.
    pub fn was_notified(&self) -> bool {
        self.was_notified.load(Ordering::Relaxed)
    }

    /// Whether the flag of `index` is currently raised.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAX_NUMBER_OF_NOTIFIERS`.
    pub fn is_active(&self, index: usize) -> bool {
        self.active_notifications[index].load(Ordering::Acquire)
    }

    /// Whether [`Listener::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.to_be_destroyed.load(Ordering::Acquire)
    }

    fn post(&self) {
        if let Err(source) = self.semaphore.post() {
            fatal::report(FatalError::SemaphorePost {
                runtime: self.runtime_name.to_string(),
                source,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn with_semaphore_value(runtime_name: &str, value: u32) -> Result<Self> {
        let mut data = Self::new(runtime_name)?;
        data.semaphore = InterprocessSemaphore::new(value);
        Ok(data)
    }
}

impl fmt::Debug for ConditionVariableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariableData")
            .field("runtime_name", &self.runtime_name)
            .field("to_be_destroyed", &self.is_destroyed())
            .field("semaphore", &self.semaphore.value())
            .finish()
    }
}

// SAFETY: atomics, a futex semaphore and an immutable name.
unsafe impl ShmSafe for ConditionVariableData {}

/// Raises one notification index of a condition variable.
///
/// Not `Clone`: each index should have exactly one notifier.
#[derive(Debug)]
pub struct Notifier<'a> {
    data: &'a ConditionVariableData,
    index: usize,
}

impl<'a> Notifier<'a> {
    /// Create a notifier for `index`.
    ///
    /// Fails with [`Error::NotifierIndexOutOfRange`] if `index` is not below
    /// [`MAX_NUMBER_OF_NOTIFIERS`].
    pub fn new(data: &'a ConditionVariableData, index: usize) -> Result<Self> {
        if index >= MAX_NUMBER_OF_NOTIFIERS {
            return Err(Error::NotifierIndexOutOfRange {
                index,
                max: MAX_NUMBER_OF_NOTIFIERS,
            });
        }
        Ok(Self { data, index })
    }

    /// Raise this notifier's flag and wake the listener.
    ///
    /// A semaphore failure is reported to the fatal error handler.
    pub fn notify(&self) {
        self.data.active_notifications[self.index].store(true, Ordering::Release);
        self.data.was_notified.store(true, Ordering::Relaxed);
        self.data.post();
        trace_notify(self.data.runtime_name.as_str(), self.index);
    }

    /// The index this notifier raises.
    #[inline]
    pub fn notification_index(&self) -> usize {
        self.index
    }
}

/// Waits for notifications on a condition variable.
#[derive(Debug)]
pub struct Listener<'a> {
    data: &'a ConditionVariableData,
}

impl<'a> Listener<'a> {
    /// Create a listener.
    pub fn new(data: &'a ConditionVariableData) -> Self {
        Self { data }
    }

    /// Block until at least one notification is pending and return all
    /// pending indices.
    ///
    /// Returns an empty vector only after [`destroy`](Self::destroy).
    pub fn wait(&self) -> NotificationVec {
        self.wait_impl(|| match self.data.semaphore.wait() {
            Ok(()) => true,
            Err(source) => {
                fatal::report(FatalError::SemaphoreWait {
                    runtime: self.data.runtime_name.to_string(),
                    source,
                });
                false
            }
        })
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`.
    ///
    /// Returns an empty vector on timeout. Blocks at most once; flags raised
    /// during that block are still collected before returning.
    pub fn timed_wait(&self, timeout: Duration) -> NotificationVec {
        self.wait_impl(|| {
            if let Err(source) = self.data.semaphore.timed_wait(timeout) {
                fatal::report(FatalError::SemaphoreWait {
                    runtime: self.data.runtime_name.to_string(),
                    source,
                });
            }
            false
        })
    }

    /// Whether the semaphore currently has a pending post. Advisory only.
    pub fn was_notified(&self) -> bool {
        self.data.semaphore.value() != 0
    }

    /// Wake the listener permanently.
    ///
    /// Pending and future waits return immediately with an empty vector.
    pub fn destroy(&self) {
        self.data.to_be_destroyed.store(true, Ordering::Release);
        self.data.post();
    }

    /// `block` waits on the semaphore and returns whether to keep looping
    /// when nothing was collected afterwards.
    fn wait_impl<F>(&self, mut block: F) -> NotificationVec
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        let mut notifications = NotificationVec::new();
        self.reset_semaphore();

        let mut return_after_collection = false;
        while !self.data.to_be_destroyed.load(Ordering::Acquire) {
            self.collect(&mut notifications);
            if !notifications.is_empty() || return_after_collection {
                break;
            }
            return_after_collection = !block();
        }

        if !notifications.is_empty() {
            let runtime = self.data.runtime_name.as_str();
            trace_wakeup(runtime, &notifications);
            record_wakeup(runtime, notifications.len(), start.elapsed());
        }
        notifications
    }

    /// Scan every flag in index order, clearing and collecting raised ones.
    fn collect(&self, notifications: &mut NotificationVec) {
        for (index, flag) in self.data.active_notifications.iter().enumerate() {
            if flag.load(Ordering::Relaxed) && flag.swap(false, Ordering::Acquire) {
                notifications.push(index);
            }
        }
    }

    /// Drain posts accumulated since the last wait; the flags carry them.
    fn reset_semaphore(&self) {
        self.data.was_notified.store(false, Ordering::Relaxed);
        loop {
            match self.data.semaphore.try_wait() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(source) => {
                    fatal::report(FatalError::SemaphoreReset {
                        runtime: self.data.runtime_name.to_string(),
                        source,
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::{TEST_HANDLER_LOCK, set_fatal_handler};
    use crate::sync::{SEM_VALUE_MAX, SemaphoreError};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread;

    #[test]
    fn test_runtime_name() {
        let name = RuntimeName::new("camera-driver").unwrap();
        assert_eq!(name.as_str(), "camera-driver");
        assert_eq!(name.to_string(), "camera-driver");

        let exact = "x".repeat(MAX_RUNTIME_NAME_LENGTH);
        assert_eq!(RuntimeName::new(&exact).unwrap().as_str(), exact);

        let too_long = "x".repeat(MAX_RUNTIME_NAME_LENGTH + 1);
        assert!(matches!(
            RuntimeName::new(&too_long),
            Err(Error::NameTooLong { max: MAX_RUNTIME_NAME_LENGTH, .. })
        ));
    }

    #[test]
    fn test_notifier_index_range() {
        let data = ConditionVariableData::new("test").unwrap();
        assert!(Notifier::new(&data, MAX_NUMBER_OF_NOTIFIERS - 1).is_ok());
        assert!(matches!(
            Notifier::new(&data, MAX_NUMBER_OF_NOTIFIERS),
            Err(Error::NotifierIndexOutOfRange { index: MAX_NUMBER_OF_NOTIFIERS, .. })
        ));
    }

    #[test]
    fn test_notify_raises_flag() {
        let data = ConditionVariableData::new("test").unwrap();
        let notifier = Notifier::new(&data, 7).unwrap();
        let listener = Listener::new(&data);

        assert!(!listener.was_notified());
        notifier.notify();

        assert!(data.is_active(7));
        assert!(data.was_notified());
        assert!(listener.was_notified());
        assert_eq!(notifier.notification_index(), 7);
    }

    #[test]
    fn test_wait_collects_sorted_indices() {
        let data = ConditionVariableData::new("test").unwrap();
        let listener = Listener::new(&data);

        for index in [42, 3, 200, 3, 0] {
            Notifier::new(&data, index).unwrap().notify();
        }

        let notifications = listener.wait();
        assert_eq!(notifications.as_slice(), &[0, 3, 42, 200]);
        assert!(!data.is_active(3));
        assert!(!listener.was_notified());
    }

    #[test]
    fn test_timed_wait_times_out_empty() {
        let data = ConditionVariableData::new("test").unwrap();
        let listener = Listener::new(&data);

        let start = Instant::now();
        assert!(listener.timed_wait(Duration::from_millis(20)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wait_woken_from_other_thread() {
        let data = Arc::new(ConditionVariableData::new("test").unwrap());

        let notifier_thread = {
            let data = Arc::clone(&data);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                Notifier::new(&data, 5).unwrap().notify();
            })
        };

        let notifications = Listener::new(&data).wait();
        assert_eq!(notifications.as_slice(), &[5]);
        notifier_thread.join().unwrap();
    }

    #[test]
    fn test_timed_wait_unbounded_duration() {
        let data = Arc::new(ConditionVariableData::new("test").unwrap());
        let listener = Listener::new(&data);

        Notifier::new(&data, 2).unwrap().notify();
        assert_eq!(listener.timed_wait(Duration::MAX).as_slice(), &[2]);

        let notifier_thread = {
            let data = Arc::clone(&data);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                Notifier::new(&data, 9).unwrap().notify();
            })
        };
        assert_eq!(listener.timed_wait(Duration::MAX).as_slice(), &[9]);
        notifier_thread.join().unwrap();
    }

    #[test]
    fn test_destroy_returns_empty() {
        let data = ConditionVariableData::new("test").unwrap();
        let listener = Listener::new(&data);

        listener.destroy();
        assert!(data.is_destroyed());
        assert!(listener.wait().is_empty());
        assert!(listener.timed_wait(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_semaphore_overflow_is_fatal() {
        let _lock = TEST_HANDLER_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _guard = {
            let seen = Arc::clone(&seen);
            set_fatal_handler(move |err| seen.lock().unwrap().push(err.clone()))
        };

        let data = ConditionVariableData::with_semaphore_value("overflowing", SEM_VALUE_MAX).unwrap();
        Notifier::new(&data, 1).unwrap().notify();

        // The flag is raised even though the post failed
        assert!(data.is_active(1));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[FatalError::SemaphorePost {
                runtime: "overflowing".into(),
                source: SemaphoreError::Overflow,
            }]
        );
    }
}
