//! Scheduler configuration

use ruler_core::JitterStrategy;
use std::time::Duration;
use tracing::warn;

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Period of the shared tick clock. Rule intervals are multiples of it.
    pub base_interval: Duration,
    /// How evaluations of same-interval rules are spread over ticks
    pub jitter: JitterStrategy,
    /// Upper bound on a single rule evaluation
    pub evaluation_timeout: Duration,
    /// Reload the rule set from the store every this many ticks (0 disables)
    pub resync_interval_ticks: u64,
    /// Interval given to rules submitted without one
    pub default_rule_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(10),
            jitter: JitterStrategy::Never,
            evaluation_timeout: Duration::from_secs(30),
            resync_interval_ticks: 30,
            default_rule_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn base_interval_seconds(&self) -> i64 {
        (self.base_interval.as_secs() as i64).max(1)
    }

    /// Default rule interval in seconds, coerced to a positive multiple of
    /// the base interval
    pub fn default_rule_interval(&self) -> i64 {
        let base = self.base_interval_seconds();
        let configured = self.default_rule_interval.as_secs() as i64;

        if configured < base {
            warn!(
                configured_seconds = configured,
                base_seconds = base,
                "Default rule interval is below the base interval, using the base interval"
            );
            return base;
        }
        if configured % base != 0 {
            let coerced = (configured / base + 1) * base;
            warn!(
                configured_seconds = configured,
                base_seconds = base,
                coerced_seconds = coerced,
                "Default rule interval is not a multiple of the base interval, rounding up"
            );
            return coerced;
        }
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, default: u64) -> SchedulerConfig {
        SchedulerConfig {
            base_interval: Duration::from_secs(base),
            default_rule_interval: Duration::from_secs(default),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_rule_interval_coercion() {
        assert_eq!(config(10, 60).default_rule_interval(), 60);
        assert_eq!(config(10, 5).default_rule_interval(), 10);
        assert_eq!(config(10, 25).default_rule_interval(), 30);
        assert_eq!(config(10, 0).default_rule_interval(), 10);
    }

    #[test]
    fn test_sub_second_base_interval() {
        let config = SchedulerConfig {
            base_interval: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.base_interval_seconds(), 1);
    }
}
