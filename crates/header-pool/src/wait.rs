//! Bounded waits on control words, blocking and cooperative.

use std::time::{Duration, Instant};

use shm_primitives::futex_wait;
use shm_primitives::sync::{AtomicU32, Ordering};

use crate::buffer::PoolBuffer;
use crate::control::Word;
use crate::layout::DRAINING;

/// How long a drain waits for in-flight writers before proceeding anyway.
pub const DRAIN_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a writer waits for a drain to finish before proceeding anyway.
/// Longer than [`DRAIN_WAIT_TIMEOUT`] since the drain may itself wait that long.
pub const WRITER_GATE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition stopped holding.
    Settled,
    /// The deadline passed while the condition still held.
    TimedOut,
}

pub(crate) fn draining(flag: u32) -> bool {
    flag == DRAINING
}

pub(crate) fn writers_active(live: u32) -> bool {
    live != 0
}

/// Block while `keep_waiting(word)` holds, for at most `timeout` in total.
///
/// Every wake re-reads the word, so spurious wakes and intermediate values
/// never end the wait early.
pub fn wait_while(
    word: &AtomicU32,
    keep_waiting: impl Fn(u32) -> bool,
    timeout: Duration,
) -> WaitOutcome {
    let deadline = Instant::now() + timeout;
    loop {
        let current = word.load(Ordering::SeqCst);
        if !keep_waiting(current) {
            return WaitOutcome::Settled;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        futex_wait(word, current, Some(deadline - now));
    }
}

/// [`wait_while`] for async callers.
///
/// Returns without leaving the task when the condition already does not hold;
/// otherwise parks the wait on tokio's blocking pool so the caller's executor
/// keeps running other tasks.
pub async fn wait_while_async(
    buffer: PoolBuffer,
    word: Word,
    keep_waiting: fn(u32) -> bool,
    timeout: Duration,
) -> WaitOutcome {
    if !keep_waiting(buffer.control().word(word).load(Ordering::SeqCst)) {
        return WaitOutcome::Settled;
    }

    let task = tokio::task::spawn_blocking(move || {
        wait_while(buffer.control().word(word), keep_waiting, timeout)
    });
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(error = %e, ?word, "blocking wait task failed");
            WaitOutcome::TimedOut
        }
    }
}

/// Wake everyone waiting on `word`. Returns how many were woken, where known.
#[inline]
pub fn notify_all(word: &AtomicU32) -> u32 {
    shm_primitives::futex_wake_all(word)
}
