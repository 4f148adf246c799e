// ── Reconnect backoff ────────────────────────────────────────────────

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration for broker reconnection.
///
/// Reconnection is retried until the session is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Base delay for the first attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the backoff window. Default: 60s.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// Upper bound of the backoff window for `attempt` (0-based):
    /// `min(max, initial * 2^attempt)`.
    pub fn window(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(i32::try_from(attempt.min(30)).unwrap_or(30));
        let base = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    /// Full-jitter delay: uniform in `[0, window(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let window = self.window(attempt).as_secs_f64();
        if window <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=window))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn window_doubles_until_capped() {
        let config = ReconnectConfig::default();
        assert_eq!(config.window(0), Duration::from_secs(1));
        assert_eq!(config.window(1), Duration::from_secs(2));
        assert_eq!(config.window(5), Duration::from_secs(32));
        assert_eq!(config.window(6), Duration::from_secs(60));
        assert_eq!(config.window(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn delay_stays_inside_window() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        for attempt in 0..20 {
            let d = config.delay(attempt);
            assert!(
                d <= config.window(attempt),
                "delay {d:?} exceeds window at attempt {attempt}"
            );
        }
    }

    #[test]
    fn zero_base_never_sleeps() {
        let config = ReconnectConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(config.delay(3), Duration::ZERO);
    }
}
