//! Deferred work: one-shot task state and the timer scheduler.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

const SCHEDULED: u8 = 0;
const CANCELLED: u8 = 1;
const EXECUTED: u8 = 2;

/// Scheduled → Executed | Cancelled, each transition taken at most once.
///
/// The timer and an explicit FLUSH may both try to run the same task; only
/// the first `try_execute` wins.
#[derive(Debug)]
pub struct TaskState(AtomicU8);

impl Default for TaskState {
    fn default() -> Self {
        Self(AtomicU8::new(SCHEDULED))
    }
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to run. `false` if already executed or cancelled.
    pub fn try_execute(&self) -> bool {
        self.transition(EXECUTED)
    }

    /// `false` if the task already ran or was cancelled.
    pub fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    pub fn is_scheduled(&self) -> bool {
        self.0.load(Ordering::Acquire) == SCHEDULED
    }

    pub fn is_executed(&self) -> bool {
        self.0.load(Ordering::Acquire) == EXECUTED
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(SCHEDULED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Runs closures after a delay on the tokio runtime.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: Mutex<Vec<AbortHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job();
        });
        let mut timers = self.timers.lock();
        timers.retain(|t| !t.is_finished());
        timers.push(handle.abort_handle());
    }

    /// Timers that have not fired yet.
    pub fn pending(&self) -> usize {
        let mut timers = self.timers.lock();
        timers.retain(|t| !t.is_finished());
        timers.len()
    }

    /// Abort every pending timer.
    pub fn shutdown(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }
}
