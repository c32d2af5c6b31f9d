//! The client-side expiry clock shared by a transaction context and all of
//! its attempts.

use std::time::{Duration, Instant};

/// Safety margin subtracted from the configured deadline so an attempt
/// aborts with time to spare for its own cleanup, rather than racing the
/// true deadline.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(2);

/// Default overall transaction deadline when the caller does not override
/// it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Tracks a transaction's monotonic start time against its configured
/// timeout.
#[derive(Debug, Clone)]
pub struct ExpiryClock {
    start: Instant,
    timeout: Duration,
}

impl ExpiryClock {
    pub fn start_now(timeout: Duration) -> Self {
        Self { start: Instant::now(), timeout }
    }

    /// `(now - start) >= timeout - SAFETY_MARGIN`.
    pub fn has_expired(&self) -> bool {
        let budget = self.timeout.saturating_sub(SAFETY_MARGIN);
        self.start.elapsed() >= budget
    }

    pub fn remaining(&self) -> Duration {
        let budget = self.timeout.saturating_sub(SAFETY_MARGIN);
        budget.saturating_sub(self.start.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_clock_has_not_expired() {
        let clock = ExpiryClock::start_now(Duration::from_secs(15));
        assert!(!clock.has_expired());
    }

    #[test]
    fn zero_timeout_is_immediately_expired() {
        let clock = ExpiryClock::start_now(Duration::ZERO);
        assert!(clock.has_expired());
    }
}
