//! Fixed-delay retry state machine for retriable worker failures.
//!
//! The dispatcher's back-off schedule is a fixed four-entry table, not a
//! computed exponential curve, so it is modeled directly here rather than
//! through a generic retry executor.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Delay applied before the Nth retry (1-indexed). A 5th classified failure
/// is terminal.
const RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(1200),
];

/// The attempt count past which a worker's retries are abandoned.
pub const TERMINAL_ATTEMPT: u32 = 5;

/// Upper bound on how long a retry cache entry is kept, measured from the
/// first classified failure (not reset on every update).
pub const RETRY_CACHE_TTL: Duration = Duration::from_secs(1800);

/// Per-`durable_name` retry bookkeeping, persisted in the retry cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    /// Number of classified retriable failures seen so far.
    pub attempt: u32,
    /// The most recent error message, for operator visibility.
    pub last_error: String,
    /// When the first failure in this run of retries was recorded. Anchors
    /// the 30-minute cache TTL so it does not slide forward on every retry.
    pub first_attempt_at: SystemTime,
}

impl RetryState {
    /// Start a new retry run at attempt 1.
    pub fn first(error: impl Into<String>) -> Self {
        Self {
            attempt: 1,
            last_error: error.into(),
            first_attempt_at: SystemTime::now(),
        }
    }

    /// Record another classified failure, incrementing `attempt` and
    /// preserving `first_attempt_at`.
    pub fn bump(&self, error: impl Into<String>) -> Self {
        Self {
            attempt: self.attempt + 1,
            last_error: error.into(),
            first_attempt_at: self.first_attempt_at,
        }
    }

    /// Whether this state has exhausted its retries (the 5th failure is
    /// terminal).
    pub fn is_terminal(&self) -> bool {
        self.attempt >= TERMINAL_ATTEMPT
    }

    /// The back-off delay for this state's current attempt.
    pub fn delay(&self) -> Duration {
        delay_for_attempt(self.attempt)
    }

    /// Remaining time-to-live for the cache entry, anchored at
    /// `first_attempt_at` rather than extended on every bump.
    pub fn remaining_ttl(&self) -> Duration {
        let elapsed = SystemTime::now()
            .duration_since(self.first_attempt_at)
            .unwrap_or_default();
        RETRY_CACHE_TTL.saturating_sub(elapsed)
    }
}

/// The back-off delay for a given 1-indexed attempt number: 30s, 1min,
/// 5min, 20min for attempts 1..=4.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    RETRY_DELAYS
        .get((attempt.saturating_sub(1)) as usize)
        .copied()
        .unwrap_or_else(|| *RETRY_DELAYS.last().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_follow_the_fixed_schedule() {
        assert_eq!(delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(delay_for_attempt(3), Duration::from_secs(300));
        assert_eq!(delay_for_attempt(4), Duration::from_secs(1200));
    }

    #[test]
    fn fifth_attempt_is_terminal() {
        let mut state = RetryState::first("boom");
        for _ in 0..3 {
            state = state.bump("boom");
        }
        assert_eq!(state.attempt, 4);
        assert!(!state.is_terminal());

        state = state.bump("boom");
        assert_eq!(state.attempt, 5);
        assert!(state.is_terminal());
    }

    #[test]
    fn bump_preserves_first_attempt_timestamp() {
        let first = RetryState::first("boom");
        let bumped = first.bump("boom again");
        assert_eq!(first.first_attempt_at, bumped.first_attempt_at);
        assert_eq!(bumped.attempt, 2);
    }
}
