//! Bounded exponential backoff.
//!
//! Two policies are derived from the refresh settings:
//! - fetch retries inside one cycle: `backoff_base_ms · 2^(n-1)`, capped at
//!   `backoff_max_ms`, at most `max_attempts` calls;
//! - cooldown before a failed sprint returns to `pending`:
//!   `cooldown_base_secs · 2^(errors-1)`, capped at `cooldown_max_secs`.

use std::time::Duration;

use sprintsync_core::config::RefreshSettings;

/// Doubling delay with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after the `n`-th consecutive failure (1-based). `n = 0` is zero.
    pub fn delay(&self, n: u32) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Retry budget for one fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RefreshSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: Backoff::new(
                Duration::from_millis(settings.backoff_base_ms),
                Duration::from_millis(settings.backoff_max_ms),
            ),
        }
    }

    /// Whether another call may follow `attempt` (1-based) failed calls.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Cooldown applied to failed sprints.
pub fn cooldown_from_settings(settings: &RefreshSettings) -> Backoff {
    Backoff::new(
        Duration::from_secs(settings.cooldown_base_secs),
        Duration::from_secs(settings.cooldown_max_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay(3), Duration::from_millis(2000));
        assert_eq!(backoff.delay(4), Duration::from_secs(3));
        assert_eq!(backoff.delay(200), Duration::from_secs(3));
    }

    #[test]
    fn default_policy_allows_three_calls() {
        let policy = RetryPolicy::from_settings(&RefreshSettings::default());
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn zero_attempts_still_makes_one_call() {
        let settings = RefreshSettings {
            max_attempts: 0,
            ..RefreshSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn cooldown_uses_second_resolution_settings() {
        let cooldown = cooldown_from_settings(&RefreshSettings::default());
        assert_eq!(cooldown.delay(1), Duration::from_secs(300));
        assert_eq!(cooldown.delay(2), Duration::from_secs(600));
    }
}
