//! Two-state circuit breaker guarding the vendor service.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Requests flow.
    Closed,
    /// Requests are skipped until the cooldown elapses.
    Open,
}

/// Counts consecutive failures and opens after `threshold` of them.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    times_opened: u64,
}

impl CircuitBreaker {
    /// A threshold of zero is treated as one.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
            times_opened: 0,
        }
    }

    /// Current phase, without applying the cooldown.
    pub fn phase(&self) -> CircuitPhase {
        if self.opened_at.is_some() {
            CircuitPhase::Open
        } else {
            CircuitPhase::Closed
        }
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// How often the circuit has opened.
    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    /// Whether a request may go out at `now`. Closes the circuit once the
    /// cooldown has elapsed.
    pub fn allow(&mut self, now: Instant) -> bool {
        let Some(opened_at) = self.opened_at else {
            return true;
        };

        if now.duration_since(opened_at) < self.cooldown {
            return false;
        }

        self.opened_at = None;
        self.consecutive_failures = 0;
        info!(
            target: "macwatch::lookup",
            cooldown_secs = self.cooldown.as_secs(),
            "circuit closed, resuming lookups"
        );
        true
    }

    /// Outcomes reported while open come from requests that started before
    /// the trip and are ignored.
    pub fn record_success(&mut self) {
        if self.opened_at.is_none() {
            self.consecutive_failures = 0;
        }
    }

    /// Returns `true` when this failure tripped the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        if self.opened_at.is_some() {
            return false;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures < self.threshold {
            return false;
        }

        self.opened_at = Some(now);
        self.times_opened += 1;
        warn!(
            target: "macwatch::lookup",
            failures = self.consecutive_failures,
            cooldown_secs = self.cooldown.as_secs(),
            "circuit opened, lookups suspended"
        );
        true
    }
}
