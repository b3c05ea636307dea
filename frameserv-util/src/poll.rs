//! Centralized polling interval for all pipeline workers.
//!
//! Workers sleep this interval whenever their input queue is empty or their
//! output queue is full. It is the main latency knob of the whole pipeline,
//! so it lives in one place and can be shrunk in tests.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

static POLL_INTERVAL_MS: AtomicU64 = AtomicU64::new(DEFAULT_POLL_INTERVAL_MS);

pub fn poll_interval() -> Duration {
    Duration::from_millis(POLL_INTERVAL_MS.load(Ordering::Relaxed))
}

/// Sleep one polling interval. Callers must check their quit flag right
/// after returning, so no wait exceeds a single interval.
pub fn idle_wait() {
    thread::sleep(poll_interval());
}

/// Test hook. `0` is clamped to 1ms so spinning workers still yield.
pub fn set_poll_interval(interval: Duration) {
    let ms = (interval.as_millis() as u64).max(1);
    POLL_INTERVAL_MS.store(ms, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_interval() {
        assert_eq!(poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_set_interval_clamps_zero() {
        set_poll_interval(Duration::from_millis(0));
        assert_eq!(poll_interval(), Duration::from_millis(1));
        set_poll_interval(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
    }
}
