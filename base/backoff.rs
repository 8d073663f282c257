//! Adaptive backoff shared by the metadata extractor's rate-limit gate and
//! the watcher's poll period.

use std::time::Duration;

/// Tracks a `current` wait that grows on repeated [`Self::backoff`] calls
/// and resets to `floor` on [`Self::cooldown`], capped at `ceiling`.
#[derive(Debug, Clone)]
pub struct ExpBackoff {
    floor: Duration,
    ceiling: Duration,
    factor: u32,
    current: Duration,
}

impl ExpBackoff {
    pub fn new(floor: Duration, ceiling: Duration, factor: u32) -> Self {
        assert!(floor > Duration::ZERO);
        assert!(ceiling >= floor);
        assert!(factor >= 2);
        ExpBackoff {
            floor,
            ceiling,
            factor,
            current: floor,
        }
    }

    /// The wait to use right now, without changing it.
    pub fn current_wait(&self) -> Duration {
        self.current
    }

    /// Grows `current` by `factor`, capped at `ceiling`, and returns the new
    /// value. Call this after a failure or rate-limit response.
    pub fn backoff(&mut self) -> Duration {
        self.current = self
            .current
            .saturating_mul(self.factor)
            .min(self.ceiling);
        self.current
    }

    /// Resets `current` to `floor`. Call this after a success.
    pub fn cooldown(&mut self) {
        self.current = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = ExpBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            2,
        );
        assert_eq!(b.current_wait(), Duration::from_secs(1));
        assert_eq!(b.backoff(), Duration::from_secs(2));
        assert_eq!(b.backoff(), Duration::from_secs(4));
        assert_eq!(b.backoff(), Duration::from_secs(8));
        assert_eq!(b.backoff(), Duration::from_secs(10)); // capped
        assert_eq!(b.backoff(), Duration::from_secs(10));
    }

    #[test]
    fn cooldown_resets_to_floor() {
        let mut b = ExpBackoff::new(Duration::from_millis(500), Duration::from_secs(60), 3);
        b.backoff();
        b.backoff();
        assert!(b.current_wait() > Duration::from_millis(500));
        b.cooldown();
        assert_eq!(b.current_wait(), Duration::from_millis(500));
    }
}
