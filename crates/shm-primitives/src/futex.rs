//! Wait/notify on a single `AtomicU32` word.
//!
//! The contract mirrors `futex(2)`: [`futex_wait`] blocks only while the word
//! still holds `expected`, and returns early when another thread or process
//! calls [`futex_wake`] on the same word. Wakes can be spurious, so callers
//! always re-read the word.
//!
//! On Linux this is the raw syscall without `FUTEX_PRIVATE_FLAG`, so waiters
//! and wakers may live in different processes mapping the same file. Other
//! targets fall back to a bounded backoff poll whose wakes are no-ops.

use core::time::Duration;

use crate::sync::{AtomicU32, load};

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexWait {
    /// Woken by a notify (or spuriously).
    Woken,
    /// The word did not hold the expected value, or changed while polling.
    ValueChanged,
    /// The timeout elapsed with the word unchanged.
    TimedOut,
}

/// Block while `word == expected`, for at most `timeout` (forever if `None`).
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    if load(word) != expected {
        return FutexWait::ValueChanged;
    }
    imp::wait(word, expected, timeout)
}

/// Wake up to `count` waiters blocked on `word`. Returns how many were woken
/// where the platform reports it, 0 otherwise.
pub fn futex_wake(word: &AtomicU32, count: u32) -> u32 {
    imp::wake(word, count)
}

/// Wake every waiter blocked on `word`.
pub fn futex_wake_all(word: &AtomicU32) -> u32 {
    imp::wake(word, i32::MAX as u32)
}

#[cfg(not(feature = "loom"))]
fn poll_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
    use std::time::Instant;

    const MAX_BACKOFF: Duration = Duration::from_millis(1);

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut backoff = Duration::from_micros(1);
    loop {
        if load(word) != expected {
            return FutexWait::ValueChanged;
        }
        let sleep_for = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return FutexWait::TimedOut;
                }
                backoff.min(deadline - now)
            }
            None => backoff,
        };
        std::thread::sleep(sleep_for);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(all(target_os = "linux", not(feature = "loom")))]
mod imp {
    use super::{AtomicU32, Duration, FutexWait, poll_wait};

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
        let ts = timeout.map(|t| {
            // SAFETY: timespec is plain data; zero is a valid value.
            let mut ts: libc::timespec = unsafe { core::mem::zeroed() };
            ts.tv_sec = t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t;
            ts.tv_nsec = t.subsec_nanos() as _;
            ts
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(core::ptr::null(), |ts| ts as *const libc::timespec);

        // SAFETY: the word is a live, aligned u32 for the duration of the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr() as *const u32,
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                core::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return FutexWait::Woken;
        }

        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => FutexWait::ValueChanged,
            Some(libc::ETIMEDOUT) => FutexWait::TimedOut,
            Some(libc::EINTR) => FutexWait::Woken,
            errno => {
                tracing::warn!(?errno, "futex wait failed, falling back to polling");
                poll_wait(word, expected, timeout)
            }
        }
    }

    pub(super) fn wake(word: &AtomicU32, count: u32) -> u32 {
        let count = count.min(i32::MAX as u32) as libc::c_int;
        // SAFETY: the word is a live, aligned u32 for the duration of the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr() as *const u32,
                libc::FUTEX_WAKE,
                count,
                core::ptr::null::<libc::timespec>(),
                core::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc < 0 {
            tracing::warn!(
                errno = ?std::io::Error::last_os_error().raw_os_error(),
                "futex wake failed"
            );
            return 0;
        }
        rc as u32
    }
}

#[cfg(all(not(target_os = "linux"), not(feature = "loom")))]
mod imp {
    use super::{AtomicU32, Duration, FutexWait, poll_wait};

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> FutexWait {
        poll_wait(word, expected, timeout)
    }

    pub(super) fn wake(_word: &AtomicU32, _count: u32) -> u32 {
        0
    }
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, Duration, FutexWait};
    use crate::sync::{load, thread};

    // Loom has no notion of time: yield once and report either a change or a
    // timeout, so callers explore both branches.
    pub(super) fn wait(word: &AtomicU32, expected: u32, _timeout: Option<Duration>) -> FutexWait {
        thread::yield_now();
        if load(word) != expected {
            FutexWait::ValueChanged
        } else {
            FutexWait::TimedOut
        }
    }

    pub(super) fn wake(_word: &AtomicU32, _count: u32) -> u32 {
        0
    }
}
