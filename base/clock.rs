//! Clock interface and implementations for testability.
//!
//! Everything in this engine that waits on wall-clock time — poll
//! intervals, backoff, file-growth polling — goes through a [`Clocks`]
//! implementation rather than calling `tokio::time` directly, so tests can
//! run a watcher's whole state machine without actually sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Abstract interface to the system clocks.
#[async_trait]
pub trait Clocks: Send + Sync + 'static {
    /// Seconds since the Unix epoch, per the system's realtime clock.
    fn unix_secs(&self) -> i64;

    /// Milliseconds on a monotonic clock. Only differences between two
    /// calls are meaningful.
    fn monotonic_millis(&self) -> i64;

    /// Suspends the calling task for `how_long`.
    async fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

#[async_trait]
impl Clocks for RealClocks {
    fn unix_secs(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64
    }

    fn monotonic_millis(&self) -> i64 {
        // A process-local monotonic origin is all callers need: they only
        // ever diff two readings.
        static ORIGIN: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let origin = *ORIGIN.get_or_init(std::time::Instant::now);
        std::time::Instant::now()
            .duration_since(origin)
            .as_millis() as i64
    }

    async fn sleep(&self, how_long: Duration) {
        tokio::time::sleep(how_long).await;
    }
}

/// Simulated clock for deterministic tests. `sleep` advances the clock
/// instantly rather than actually suspending — callers that need to
/// observe interleaving should await a channel instead.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot_secs: i64,
    elapsed_millis: AtomicI64,
}

impl SimulatedClocks {
    pub fn new(boot_secs: i64) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot_secs,
            elapsed_millis: AtomicI64::new(0),
        }))
    }

    /// Advances the clock without going through the `Clocks::sleep` path;
    /// useful in tests that want to advance time and then separately
    /// trigger the code under test.
    pub fn advance(&self, by: Duration) {
        self.0
            .elapsed_millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clocks for SimulatedClocks {
    fn unix_secs(&self) -> i64 {
        self.0.boot_secs + self.0.elapsed_millis.load(Ordering::SeqCst) / 1000
    }

    fn monotonic_millis(&self) -> i64 {
        self.0.elapsed_millis.load(Ordering::SeqCst)
    }

    async fn sleep(&self, how_long: Duration) {
        self.advance(how_long);
        // Yield once so code awaiting this sleep doesn't starve other
        // tasks scheduled on the same executor in a test.
        tokio::task::yield_now().await;
    }
}

/// Logs a warning if a long-lived block takes "too long" relative to its
/// label, without adding overhead to the common case.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start_millis: i64,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start_millis: clocks.monotonic_millis(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic_millis() - self.start_millis;
        if elapsed >= 1000 {
            let label_f = self.label_f.take().unwrap();
            tracing::warn!(elapsed_ms = elapsed, "{} took a while", label_f().as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_clock_advances_on_sleep() {
        let c = SimulatedClocks::new(1_700_000_000);
        assert_eq!(c.unix_secs(), 1_700_000_000);
        c.sleep(Duration::from_secs(90)).await;
        assert_eq!(c.unix_secs(), 1_700_000_090);
        assert_eq!(c.monotonic_millis(), 90_000);
    }
}
