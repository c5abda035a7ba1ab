//! Counting semaphore that works across process boundaries.

use super::futex::{self, WaitOutcome};
use crate::memory::ShmSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Largest value the semaphore can hold (mirrors POSIX `SEM_VALUE_MAX`).
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

/// Semaphore failures.
///
/// These indicate misuse or corrupted shared state; a timeout is not an error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    /// A post would push the count beyond [`SEM_VALUE_MAX`].
    #[error("semaphore overflow: value would exceed SEM_VALUE_MAX")]
    Overflow,

    /// The underlying futex call failed unexpectedly.
    #[error("futex operation failed: {0}")]
    Os(rustix::io::Errno),
}

impl SemaphoreError {
    fn from_io(err: std::io::Error) -> Self {
        SemaphoreError::Os(rustix::io::Errno::from_io_error(&err).unwrap_or(rustix::io::Errno::IO))
    }
}

/// A counting semaphore built on a shared futex word.
///
/// The semaphore is `#[repr(C)]` and holds no pointers, so it can be placed in
/// shared memory and used from every process that maps it.
///
/// # Memory Layout
///
/// ```text
/// ┌──────────────────┬──────────────────┐
/// │  count: u32      │  waiters: u32    │
/// └──────────────────┴──────────────────┘
/// ```
///
/// `post` has release semantics and a successful `wait` has acquire
/// semantics, so writes made before a post are visible after the matching
/// wait returns.
#[repr(C)]
#[derive(Debug)]
pub struct InterprocessSemaphore {
    count: AtomicU32,
    waiters: AtomicU32,
}

impl InterprocessSemaphore {
    /// Create a semaphore with the given initial value.
    ///
    /// Values above [`SEM_VALUE_MAX`] are clamped.
    pub const fn new(initial: u32) -> Self {
        let initial = if initial > SEM_VALUE_MAX {
            SEM_VALUE_MAX
        } else {
            initial
        };
        Self {
            count: AtomicU32::new(initial),
            waiters: AtomicU32::new(0),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) -> Result<(), SemaphoreError> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current >= SEM_VALUE_MAX {
                return Err(SemaphoreError::Overflow);
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.waiters.load(Ordering::SeqCst) > 0 {
            futex::wake(&self.count, 1).map_err(SemaphoreError::from_io)?;
        }
        Ok(())
    }

    /// Decrement the count if it is positive, without blocking.
    ///
    /// Returns `true` if the count was decremented.
    pub fn try_wait(&self) -> Result<bool, SemaphoreError> {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
        Ok(false)
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) -> Result<(), SemaphoreError> {
        loop {
            if self.try_wait()? {
                return Ok(());
            }
            self.block(None)?;
        }
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`.
    ///
    /// Returns `false` if the timeout elapsed before the count could be
    /// decremented. A timeout too large to express as a deadline (such as
    /// `Duration::MAX`) waits without limit.
    pub fn timed_wait(&self, timeout: Duration) -> Result<bool, SemaphoreError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait()?;
            return Ok(true);
        };
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if self.block(Some(deadline - now))? == WaitOutcome::TimedOut {
                return self.try_wait();
            }
        }
    }

    /// Current count. Advisory only: it may change immediately.
    #[inline]
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    fn block(&self, timeout: Option<Duration>) -> Result<WaitOutcome, SemaphoreError> {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let outcome = futex::wait(&self.count, 0, timeout);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        outcome.map_err(SemaphoreError::from_io)
    }
}

impl Default for InterprocessSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

// SAFETY: only atomics, no pointers.
unsafe impl ShmSafe for InterprocessSemaphore {}
