//! Resubscription Backoff
//!
//! Exponential backoff with jitter used by ingestors when an upstream
//! stream fails to open or ends mid-flight.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::UpstreamSettings;

/// Backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Retries before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Build from upstream settings.
    #[must_use]
    pub const fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// No jitter and a fixed delay, for deterministic retries.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }
}

/// Backoff state for one ingestor.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt_count: 0,
        }
    }

    /// Next delay, or `None` once `max_attempts` retries have been used.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            scaled as u128
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Sleep for the next delay.
    ///
    /// Returns `false` without sleeping when retries are exhausted, or early
    /// when `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.next_delay() else {
            return false;
        };
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Back to the initial delay after a successful subscription.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Retries used since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn delays_double_until_capped() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 500, 0));
        let delays: Vec<u128> = (0..5)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, [100, 200, 400, 500, 500]);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut policy = ReconnectPolicy::new(no_jitter(10, 100, 2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 10_000, 3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                jitter_factor: 0.1,
                ..no_jitter(1000, 10_000, 0)
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn fixed_config_never_grows() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_millis(5), 0));
        for _ in 0..10 {
            assert_eq!(policy.next_delay(), Some(Duration::from_millis(5)));
        }
    }

    #[tokio::test]
    async fn wait_sleeps_then_succeeds() {
        let mut policy = ReconnectPolicy::new(no_jitter(5, 5, 0));
        let cancel = CancellationToken::new();
        assert!(policy.wait(&cancel).await);
        assert_eq!(policy.attempt_count(), 1);
    }

    #[tokio::test]
    async fn wait_returns_false_when_cancelled() {
        let mut policy = ReconnectPolicy::new(no_jitter(60_000, 60_000, 0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!policy.wait(&cancel).await);
    }

    #[tokio::test]
    async fn wait_returns_false_when_exhausted() {
        let mut policy = ReconnectPolicy::new(no_jitter(1, 1, 1));
        let cancel = CancellationToken::new();
        assert!(policy.wait(&cancel).await);
        assert!(!policy.wait(&cancel).await);
    }
}
