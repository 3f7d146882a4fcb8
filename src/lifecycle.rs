//! Cooperative cancellation for the long-running link threads
//!
//! Loops poll a [`StopFlag`] at least once per backoff interval. Owners stop
//! them with [`join_within`], which never waits longer than its budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::STOP_CHECK_INTERVAL_MS;

/// Shared "keep running" flag
#[derive(Debug, Clone)]
pub struct StopFlag {
    running: Arc<AtomicBool>,
}

impl StopFlag {
    /// Create a flag in the running state
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the owner still wants the loop to run
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask every holder of this flag to stop
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Sleep for `duration`, waking early if a stop is requested.
    /// Returns whether the flag is still running.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let slice = Duration::from_millis(STOP_CHECK_INTERVAL_MS);
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(slice.min(deadline - now));
        }
        self.is_running()
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait up to `timeout` for `handle` to finish.
///
/// Hands the handle back if the thread is still alive at the deadline, so the
/// caller decides whether to retry or report it.
pub fn join_within(handle: JoinHandle<()>, timeout: Duration) -> Result<(), JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(STOP_CHECK_INTERVAL_MS / 2));
    }

    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    if handle.join().is_err() {
        tracing::error!("Thread {} panicked", name);
    }
    Ok(())
}
