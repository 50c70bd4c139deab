//! Adaptive inter-request pacing.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

/// Upper bound for an interval calibrated from a probe response time.
pub const PROBE_INTERVAL_CEILING: Duration = Duration::from_secs(10);

/// Current request spacing and the bounds it moves within.
#[derive(Debug, Clone)]
pub struct RateState {
    current: Duration,
    min: Duration,
    max: Duration,
    decrease_factor: f64,
    /// Slot reserved by the most recent request.
    last_request: Option<Instant>,
}

impl RateState {
    /// Starts at `min`. `decrease_factor` is clamped to `[0, 1]`.
    pub fn new(min: Duration, max: Duration, decrease_factor: f64) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
            decrease_factor: decrease_factor.clamp(0.0, 1.0),
            last_request: None,
        }
    }

    /// Spacing applied to the next request.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Lower bound.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Reserve the next request slot and return how long the caller must
    /// wait before issuing it. Parallel callers get successive slots.
    pub fn reserve_slot(&mut self, now: Instant) -> Duration {
        let slot = match self.last_request {
            Some(last) => (last + self.current).max(now),
            None => now,
        };
        self.last_request = Some(slot);
        slot - now
    }

    /// Double the interval up to the maximum. Returns the new value when it
    /// actually changed.
    pub fn increase(&mut self) -> Option<Duration> {
        let doubled = self.current.saturating_mul(2).max(self.min);
        self.set(doubled.min(self.max))
    }

    /// Shrink the interval by the configured fraction, never below the
    /// minimum.
    pub fn decrease(&mut self) -> Option<Duration> {
        let reduced = self.current.mul_f64(self.decrease_factor);
        self.set(reduced.max(self.min))
    }

    /// Seed the interval from an observed response time.
    pub fn calibrate(&mut self, response_time: Duration) -> Option<Duration> {
        let ceiling = PROBE_INTERVAL_CEILING.min(self.max).max(self.min);
        let target = response_time.saturating_mul(2).clamp(self.min, ceiling);
        self.set(target)
    }

    fn set(&mut self, next: Duration) -> Option<Duration> {
        if next == self.current {
            return None;
        }
        let previous = self.current;
        self.current = next;
        info!(
            target: "macwatch::lookup",
            previous_ms = previous.as_millis() as u64,
            interval_ms = next.as_millis() as u64,
            "lookup interval changed"
        );
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RateState {
        RateState::new(Duration::from_secs(3), Duration::from_secs(60), 0.8)
    }

    #[test]
    fn increase_doubles_up_to_max() {
        let mut rate = state();
        let mut seen = Vec::new();
        for _ in 0..8 {
            rate.increase();
            seen.push(rate.current().as_secs());
        }
        assert_eq!(seen, vec![6, 12, 24, 48, 60, 60, 60, 60]);
        assert_eq!(rate.increase(), None, "no change once capped");
    }

    #[test]
    fn ten_successes_move_toward_min_without_crossing() {
        let mut rate = state();
        for _ in 0..5 {
            rate.increase();
        }
        assert_eq!(rate.current(), Duration::from_secs(60));

        let mut previous = rate.current();
        for _ in 0..10 {
            rate.decrease();
            assert!(rate.current() <= previous);
            assert!(rate.current() >= rate.min());
            previous = rate.current();
        }
        assert!(rate.current() < Duration::from_secs(60));

        for _ in 0..50 {
            rate.decrease();
        }
        assert_eq!(rate.current(), rate.min());
        assert_eq!(rate.decrease(), None);
    }

    #[test]
    fn slots_are_spaced_by_current_interval() {
        let mut rate = state();
        let start = Instant::now();

        assert_eq!(rate.reserve_slot(start), Duration::ZERO);
        assert_eq!(rate.reserve_slot(start), Duration::from_secs(3));
        assert_eq!(rate.reserve_slot(start), Duration::from_secs(6));

        let later = start + Duration::from_secs(30);
        assert_eq!(rate.reserve_slot(later), Duration::ZERO);
    }

    #[test]
    fn calibration_is_clamped() {
        let mut rate = state();
        rate.calibrate(Duration::from_millis(500));
        assert_eq!(rate.current(), Duration::from_secs(3));

        rate.calibrate(Duration::from_secs(4));
        assert_eq!(rate.current(), Duration::from_secs(8));

        rate.calibrate(Duration::from_secs(30));
        assert_eq!(rate.current(), PROBE_INTERVAL_CEILING);
    }
}
