//! Backoff policy for queued deliveries.
//!
//! This module maps an envelope's delivery-attempt history to the moment it
//! next becomes eligible, and its age to expiration. It performs no I/O and
//! holds no state beyond its configuration, so schedule behavior can be
//! tested in isolation.

use postrider_common::DeliveryKind;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for queued deliveries.
///
/// Local and bounce deliveries ramp up linearly after a burst of immediate
/// retries; relay deliveries back off exponentially from the start. Both
/// settle at `max_interval_secs` once the queue has clearly gone nowhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base interval between relay delivery attempts (in seconds).
    ///
    /// Default: 900 seconds (15 minutes)
    #[serde(default = "defaults::base_interval_secs")]
    pub base_interval_secs: u64,

    /// Per-attempt ramp step for local and bounce deliveries (in seconds).
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::ramp_step_secs")]
    pub ramp_step_secs: u64,

    /// Width of the uniform jitter draw added to ramped local retries
    /// (in seconds).
    ///
    /// Jitter spreads out retries of messages that failed together. Values
    /// above `ramp_step_secs` can reorder consecutive attempts.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::jitter_window_secs")]
    pub jitter_window_secs: u64,

    /// Longest interval between two attempts of the same envelope
    /// (in seconds).
    ///
    /// Default: 14400 seconds (4 hours)
    #[serde(default = "defaults::max_interval_secs")]
    pub max_interval_secs: u64,

    /// Queue lifetime granted to a fresh envelope before it bounces
    /// (in seconds).
    ///
    /// Default: 345600 seconds (4 days)
    #[serde(default = "defaults::expire_after_secs")]
    pub expire_after_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_secs: defaults::base_interval_secs(),
            ramp_step_secs: defaults::ramp_step_secs(),
            jitter_window_secs: defaults::jitter_window_secs(),
            max_interval_secs: defaults::max_interval_secs(),
            expire_after_secs: defaults::expire_after_secs(),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute when an envelope is next eligible for a delivery attempt.
    ///
    /// # Schedule
    ///
    /// An envelope that has never been attempted is due immediately. After
    /// that, local and bounce deliveries stay immediately retryable through
    /// four attempts, then move to `last_attempt_time + attempt_count *
    /// ramp_step_secs` plus a jitter draw, and from the fifteenth attempt sit
    /// at `max_interval_secs`. Relay deliveries wait `base_interval_secs`
    /// for the first two attempts, double it each attempt from the third,
    /// and cap at `max_interval_secs` from the eighth.
    ///
    /// The returned time is never before `now`.
    #[must_use]
    pub fn next_due(
        &self,
        kind: DeliveryKind,
        attempt_count: u32,
        last_attempt_time: u64,
        now: u64,
    ) -> u64 {
        if last_attempt_time == 0 {
            return now;
        }

        let due = match kind {
            DeliveryKind::Mda | DeliveryKind::Bounce => {
                self.local_due(attempt_count, last_attempt_time, now)
            }
            DeliveryKind::Mta => self.relay_due(attempt_count, last_attempt_time),
        };

        due.max(now)
    }

    fn local_due(&self, attempt_count: u32, last_attempt_time: u64, now: u64) -> u64 {
        match attempt_count {
            0..=4 => now,
            5..=14 => {
                let ramp = u64::from(attempt_count).saturating_mul(self.ramp_step_secs);
                last_attempt_time
                    .saturating_add(ramp)
                    .saturating_add(self.jitter())
            }
            _ => last_attempt_time.saturating_add(self.max_interval_secs),
        }
    }

    fn relay_due(&self, attempt_count: u32, last_attempt_time: u64) -> u64 {
        let interval = match attempt_count {
            0..=2 => self.base_interval_secs,
            3..=7 => {
                let multiplier = 1_u64 << (attempt_count - 3);
                self.base_interval_secs
                    .saturating_mul(multiplier)
                    .min(self.max_interval_secs)
            }
            _ => self.max_interval_secs,
        };

        last_attempt_time.saturating_add(interval)
    }

    fn jitter(&self) -> u64 {
        if self.jitter_window_secs == 0 {
            return 0;
        }

        rand::rng().random_range(0..self.jitter_window_secs)
    }

    /// Check whether an envelope has outlived its queue lifetime.
    #[must_use]
    pub const fn is_expired(creation_time: u64, expire_after_secs: u64, now: u64) -> bool {
        now.saturating_sub(creation_time) >= expire_after_secs
    }

    /// The instant an envelope created at `creation_time` will expire under
    /// this policy's default lifetime.
    #[must_use]
    pub const fn expires_at(&self, creation_time: u64) -> u64 {
        creation_time.saturating_add(self.expire_after_secs)
    }
}

mod defaults {
    pub const fn base_interval_secs() -> u64 {
        900 // 15 minutes
    }

    pub const fn ramp_step_secs() -> u64 {
        60
    }

    pub const fn jitter_window_secs() -> u64 {
        60
    }

    pub const fn max_interval_secs() -> u64 {
        14400 // 4 hours
    }

    pub const fn expire_after_secs() -> u64 {
        345_600 // 4 days
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn jitterless() -> RetryPolicy {
        RetryPolicy {
            jitter_window_secs: 0, // No jitter for predictable testing
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_interval_secs, 900);
        assert_eq!(policy.ramp_step_secs, 60);
        assert_eq!(policy.jitter_window_secs, 60);
        assert_eq!(policy.max_interval_secs, 14400);
        assert_eq!(policy.expire_after_secs, 345_600);
    }

    #[test]
    fn test_never_attempted_is_due_immediately() {
        let policy = jitterless();

        for kind in [DeliveryKind::Mda, DeliveryKind::Mta, DeliveryKind::Bounce] {
            assert_eq!(policy.next_due(kind, 0, 0, 5000), 5000);
            // A nonzero attempt count without a recorded attempt still counts
            // as never attempted.
            assert_eq!(policy.next_due(kind, 3, 0, 5000), 5000);
        }
    }

    #[test]
    fn test_local_early_attempts_are_immediately_retryable() {
        let policy = jitterless();

        for attempt in 1..=4 {
            assert_eq!(
                policy.next_due(DeliveryKind::Mda, attempt, 1000, 2000),
                2000,
                "attempt {attempt} should be due right away"
            );
        }
    }

    #[test]
    fn test_local_ramp_bracket() {
        let policy = jitterless();

        // attempt_count * ramp_step_secs past the last attempt
        assert_eq!(policy.next_due(DeliveryKind::Mda, 5, 1000, 1000), 1300);
        assert_eq!(policy.next_due(DeliveryKind::Mda, 10, 1000, 1000), 1600);
        assert_eq!(policy.next_due(DeliveryKind::Bounce, 14, 1000, 1000), 1840);
    }

    #[test]
    fn test_local_settles_at_max_interval() {
        let policy = jitterless();

        assert_eq!(policy.next_due(DeliveryKind::Mda, 15, 1000, 1000), 15400);
        assert_eq!(policy.next_due(DeliveryKind::Mda, 40, 1000, 1000), 15400);
    }

    #[test]
    fn test_local_jitter_stays_within_window() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            let due = policy.next_due(DeliveryKind::Mda, 5, 1000, 1000);
            assert!(
                (1300..1360).contains(&due),
                "due {due} escaped the jitter window"
            );
        }
    }

    #[test]
    fn test_relay_exponential_brackets() {
        let policy = jitterless();

        // Flat base for the first two attempts
        assert_eq!(policy.next_due(DeliveryKind::Mta, 1, 1000, 1000), 1900);
        assert_eq!(policy.next_due(DeliveryKind::Mta, 2, 1000, 1000), 1900);

        // Doubling from the third attempt
        assert_eq!(policy.next_due(DeliveryKind::Mta, 3, 1000, 1000), 1900);
        assert_eq!(policy.next_due(DeliveryKind::Mta, 4, 1000, 1000), 2800);
        assert_eq!(policy.next_due(DeliveryKind::Mta, 5, 1000, 1000), 4600);
        assert_eq!(policy.next_due(DeliveryKind::Mta, 6, 1000, 1000), 8200);

        // Capped at max_interval_secs
        assert_eq!(policy.next_due(DeliveryKind::Mta, 7, 1000, 1000), 15400);
        assert_eq!(policy.next_due(DeliveryKind::Mta, 8, 1000, 1000), 15400);
        assert_eq!(policy.next_due(DeliveryKind::Mta, 20, 1000, 1000), 15400);
    }

    #[test]
    fn test_due_never_before_now() {
        let policy = jitterless();

        // The computed schedule would land far in the past
        let due = policy.next_due(DeliveryKind::Mta, 1, 1000, 1_000_000);
        assert_eq!(due, 1_000_000);
    }

    #[test]
    fn test_backoff_monotonicity() {
        let policy = jitterless();

        for kind in [DeliveryKind::Mda, DeliveryKind::Mta, DeliveryKind::Bounce] {
            let mut previous = 0;
            for attempt in 1..=20 {
                let due = policy.next_due(kind, attempt, 1000, 1000);
                let offset = due - 1000;
                assert!(
                    offset >= previous,
                    "{kind} attempt {attempt} moved due time backwards ({offset} < {previous})"
                );
                previous = offset;
            }
        }
    }

    #[test]
    fn test_is_expired_boundary() {
        assert!(!RetryPolicy::is_expired(1000, 300, 1299));
        assert!(RetryPolicy::is_expired(1000, 300, 1300));
        assert!(RetryPolicy::is_expired(1000, 300, 1301));
        assert!(RetryPolicy::is_expired(1000, 0, 1000));
    }

    #[test]
    fn test_expires_at_uses_default_lifetime() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.expires_at(1000), 1000 + 345_600);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let policy: RetryPolicy =
            ron::from_str("(base_interval_secs: 30)").expect("valid config");
        assert_eq!(policy.base_interval_secs, 30);
        assert_eq!(policy.max_interval_secs, 14400);
        assert_eq!(policy.expire_after_secs, 345_600);
    }
}
