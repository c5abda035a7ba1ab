//! Futex wait/wake on a shared 32-bit word.
//!
//! The futexes here are *shared* (no `FUTEX_PRIVATE_FLAG`), so a word that
//! lives in a `MAP_SHARED` mapping can be waited on from one process and
//! woken from another, regardless of where each process mapped it.
//!
//! On targets without futexes the wait degrades to short sleeps that re-check
//! the word; wake is then a no-op.

use std::io;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// How a futex wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken, interrupted, or the word no longer held the expected value.
    Woken,
    /// The timeout elapsed.
    TimedOut,
}

/// Block while `*word == expected`, for at most `timeout`.
///
/// Spurious returns are possible; callers re-check their condition.
#[cfg(target_os = "linux")]
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
    let ts = timeout.map(|d| {
        // SAFETY: timespec is plain data; zeroed covers any padding fields.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t;
        ts.tv_nsec = d.subsec_nanos() as _;
        ts
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call and
    // FUTEX_WAIT only reads it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == 0 {
        return Ok(WaitOutcome::Woken);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(WaitOutcome::Woken),
        Some(libc::ETIMEDOUT) => Ok(WaitOutcome::TimedOut),
        _ => Err(err),
    }
}

/// Wake up to `count` waiters blocked on `word`.
///
/// Returns the number of waiters woken.
#[cfg(target_os = "linux")]
pub(crate) fn wake(word: &AtomicU32, count: u32) -> io::Result<usize> {
    let count = count.min(i32::MAX as u32) as libc::c_int;

    // SAFETY: `word` is a valid, aligned u32; FUTEX_WAKE does not access it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(not(target_os = "linux"))]
const POLL_INTERVAL: Duration = Duration::from_micros(50);

#[cfg(not(target_os = "linux"))]
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    let deadline = timeout.map(|t| Instant::now() + t);
    while word.load(Ordering::Acquire) == expected {
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        } else {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    Ok(WaitOutcome::Woken)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wake(_word: &AtomicU32, _count: u32) -> io::Result<usize> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_returns_when_value_differs() {
        let word = AtomicU32::new(1);
        let outcome = wait(&word, 0, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let outcome = wait(&word, 0, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait(&word, 0, Some(Duration::from_secs(5))).unwrap();
                }
            })
        };

        thread::sleep(Duration::from_millis(10));
        word.store(1, Ordering::Release);
        wake(&word, u32::MAX).unwrap();
        waiter.join().unwrap();
    }
}
