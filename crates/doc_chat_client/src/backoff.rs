//! Exponential reconnect delays: 1s, 2s, 4s, ... capped, for a bounded number of attempts.

use std::time::Duration;

use crate::config::ConnectionSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u8,
}

impl Backoff {
    pub fn from_settings(settings: &ConnectionSection) -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(settings.max_backoff_secs),
            max_retries: settings.max_retries,
        }
    }

    /// Delay before `attempt` (1-based).
    pub fn delay(&self, attempt: u8) -> Duration {
        let shift = u32::from(attempt.saturating_sub(1)).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.max_delay)
    }

    /// `(attempt, delay)` for every attempt.
    pub fn attempts(&self) -> impl Iterator<Item = (u8, Duration)> + '_ {
        (1..=self.max_retries).map(move |attempt| (attempt, self.delay(attempt)))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_settings(&ConnectionSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 6,
        };
        let delays: Vec<u64> = backoff.attempts().map(|(_, d)| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn large_attempts_do_not_overflow() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn default_matches_connection_defaults() {
        let backoff = Backoff::default();
        assert_eq!(backoff.max_retries, 5);
        assert_eq!(backoff.attempts().count(), 5);
    }
}
