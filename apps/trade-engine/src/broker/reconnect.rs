//! Broker reconnection policy: fixed interval, capped attempts.

use std::time::{Duration, Instant};

use crate::config::BrokerConfig;

/// Reconnection policy with a fixed delay between attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before each attempt.
    interval: Duration,
    /// Maximum attempts before giving up.
    max_attempts: u32,
    /// Current attempt count.
    current_attempt: u32,
    /// Last attempt timestamp.
    last_attempt: Option<Instant>,
}

impl ReconnectPolicy {
    /// Create a new reconnect policy from configuration.
    #[must_use]
    pub const fn new(config: &BrokerConfig) -> Self {
        Self::with_params(config.reconnect_interval(), config.max_reconnect_attempts)
    }

    /// Create with custom parameters.
    #[must_use]
    pub const fn with_params(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            current_attempt: 0,
            last_attempt: None,
        }
    }

    /// Delay before the next attempt.
    ///
    /// Returns `None` if max attempts have been exceeded.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }
        self.current_attempt += 1;
        self.last_attempt = Some(Instant::now());
        Some(self.interval)
    }

    /// Reset the policy after a successful connection or a manual request.
    pub const fn reset(&mut self) {
        self.current_attempt = 0;
        self.last_attempt = None;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Get the maximum attempts allowed.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Check if reconnection should be attempted.
    #[must_use]
    pub const fn should_reconnect(&self) -> bool {
        self.current_attempt < self.max_attempts
    }

    /// Get time since last attempt.
    #[must_use]
    pub fn time_since_last_attempt(&self) -> Option<Duration> {
        self.last_attempt.map(|t| t.elapsed())
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.current_attempt(), 0);
        assert_eq!(policy.max_attempts(), 10);
        assert!(policy.should_reconnect());
        assert!(policy.time_since_last_attempt().is_none());
    }

    #[test]
    fn reconnect_policy_fixed_interval() {
        let mut policy = ReconnectPolicy::with_params(Duration::from_secs(5), 3);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(policy.current_attempt(), 2);
        assert!(policy.time_since_last_attempt().is_some());
    }

    #[test]
    fn reconnect_policy_exhausted() {
        let mut policy = ReconnectPolicy::with_params(Duration::from_millis(100), 3);

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_reconnect());
    }

    #[test]
    fn reconnect_policy_reset() {
        let mut policy = ReconnectPolicy::with_params(Duration::from_millis(100), 1);
        assert!(policy.next_delay().is_some());
        assert!(!policy.should_reconnect());

        policy.reset();
        assert_eq!(policy.current_attempt(), 0);
        assert!(policy.next_delay().is_some());
    }
}
