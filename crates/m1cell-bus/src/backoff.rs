//! [`Backoff`] – bounded exponential reconnect pacing.
//!
//! Used by every reconnect gate in the cell: the bridge's bus and device
//! connections and the web surface's background bus reconnect.  Attempts are
//! never blocked on; callers ask [`Backoff::ready`] each tick and report the
//! outcome.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            next_attempt: None,
            failures: 0,
        }
    }

    /// `true` when an attempt is allowed at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }

    /// Record a failed attempt and return the wait before the next one.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let wait = self.current;
        self.next_attempt = Some(now + wait);
        self.current = (self.current * 2).min(self.max);
        self.failures = self.failures.saturating_add(1);
        wait
    }

    /// Reset after a successful attempt.
    pub fn succeeded(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
        self.failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(2))
    }
}
