//! Completion tracking for dispatched pair work.
//!
//! A [`CompletionCounter`] is preset to the number of pairs dispatched for a
//! graph and counts down as pairs are recorded. [`await_completion`] polls it
//! and gives up once it has seen no progress for a number of consecutive polls.
//! That is a liveness heuristic: a slow worker can be reported as stalled, so a
//! [`StallError`] means "retry or escalate", not "the graph is inconsistent".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of consecutive polls without progress before giving up.
pub const DEFAULT_MAX_STALLS: u32 = 5;

/// Raised when the counter stops moving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no progress after {stalled_polls} polls with {remaining} pairs outstanding ({failed} failed)")]
pub struct StallError {
    /// Pairs still outstanding when the wait gave up.
    pub remaining: u64,
    /// Consecutive polls that showed no decrease.
    pub stalled_polls: u32,
    /// Pairs known to have failed; these never count down.
    pub failed: u64,
}

/// Outcome of a cancellable wait that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The counter stopped moving.
    #[error(transparent)]
    Stalled(#[from] StallError),

    /// The caller cancelled the wait. Dispatched work keeps running.
    #[error("wait cancelled with {remaining} pairs outstanding")]
    Cancelled {
        /// Pairs still outstanding at cancellation.
        remaining: u64,
    },
}

/// Read side of a shared countdown.
///
/// Distributed deployments back this with a shared atomic; the in-process
/// implementation is [`CompletionCounter`].
pub trait ProgressCounter: Send + Sync {
    /// Pairs not yet recorded.
    fn remaining(&self) -> u64;

    /// Pairs that failed and will not be recorded.
    fn failed(&self) -> u64 {
        0
    }
}

/// In-process countdown of outstanding pairs.
#[derive(Debug)]
pub struct CompletionCounter {
    remaining: AtomicU64,
    failed: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl CompletionCounter {
    /// Creates a counter preset to `total` outstanding pairs.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            remaining: AtomicU64::new(total),
            failed: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    /// Records one completed pair. Saturates at zero.
    pub fn complete_one(&self) {
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Records one failed pair.
    ///
    /// The outstanding count is left untouched, so a failed pair shows up as a
    /// stall instead of masquerading as progress.
    pub fn fail_one(&self, reason: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut last) = self.last_failure.lock() {
            *last = Some(reason.into());
        }
    }

    /// Message of the most recent failure.
    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().ok().and_then(|last| last.clone())
    }

    /// Returns true once every pair has been recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

impl ProgressCounter for CompletionCounter {
    fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }
}

/// Blocks the calling thread between polls.
pub trait Sleeper: Send + Sync {
    /// Sleeps for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Interval between polls.
    pub interval: Duration,
    /// Consecutive polls without a decrease before giving up.
    pub max_stalls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_stalls: DEFAULT_MAX_STALLS,
        }
    }
}

/// Waits until `counter` reaches zero.
///
/// Polls every `poll.interval`. A poll that observes a strictly smaller value
/// than the previous one resets the stall count; any other poll increments it.
///
/// # Errors
/// Returns [`StallError`] once `poll.max_stalls` consecutive polls show no decrease.
pub fn await_completion(
    counter: &dyn ProgressCounter,
    poll: &PollConfig,
    sleeper: &dyn Sleeper,
) -> Result<(), StallError> {
    let never = AtomicBool::new(false);
    match await_completion_or_cancel(counter, poll, sleeper, &never) {
        Ok(()) => Ok(()),
        Err(WaitError::Stalled(err)) => Err(err),
        // `never` is never set.
        Err(WaitError::Cancelled { remaining }) => Err(StallError {
            remaining,
            stalled_polls: 0,
            failed: counter.failed(),
        }),
    }
}

/// Like [`await_completion`], but also stops when `cancel` becomes true.
///
/// `cancel` is checked before each sleep and after each wake-up. Cancelling
/// only abandons the wait; dispatched work is not interrupted.
///
/// # Errors
/// - `Stalled` once `poll.max_stalls` consecutive polls show no decrease
/// - `Cancelled` if `cancel` was set first
pub fn await_completion_or_cancel(
    counter: &dyn ProgressCounter,
    poll: &PollConfig,
    sleeper: &dyn Sleeper,
    cancel: &AtomicBool,
) -> Result<(), WaitError> {
    let mut last = counter.remaining();
    let mut stalls = 0u32;

    loop {
        if last == 0 {
            return Ok(());
        }
        if cancel.load(Ordering::Acquire) {
            return Err(WaitError::Cancelled { remaining: last });
        }

        sleeper.sleep(poll.interval);

        let current = counter.remaining();
        if current == 0 {
            return Ok(());
        }
        if current < last {
            stalls = 0;
        } else {
            stalls += 1;
        }
        debug!(remaining = current, previous = last, stalls, "completion poll");
        last = current;

        if stalls >= poll.max_stalls {
            let failed = counter.failed();
            warn!(remaining = current, stalls, failed, "completion wait stalled");
            return Err(WaitError::Stalled(StallError {
                remaining: current,
                stalled_polls: stalls,
                failed,
            }));
        }
    }
}
