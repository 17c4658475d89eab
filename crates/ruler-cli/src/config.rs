//! Configuration file for the `ruler` binary
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration.

use anyhow::{Context, Result};
use ruler_core::{DatabaseConfig, JitterStrategy, StateConfig};
use ruler_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSection,
    pub scheduler: SchedulerSection,
    pub state: StateSection,
    pub evaluator: EvaluatorSection,
    pub notifications: NotificationsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Overridden by `--db-path` / `RULER_DB_PATH`
    pub path: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
            acquire_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub base_interval_seconds: u64,
    /// `never`, `by_group` or `by_rule`
    pub jitter: String,
    pub evaluation_timeout_seconds: u64,
    pub resync_interval_ticks: u64,
    pub default_rule_interval_seconds: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            base_interval_seconds: 10,
            jitter: "never".to_string(),
            evaluation_timeout_seconds: 30,
            resync_interval_ticks: 30,
            default_rule_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub resend_delay_seconds: u64,
    pub max_results_window: usize,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            resend_delay_seconds: 30,
            max_results_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSection {
    /// JSON file of `{metric, labels, value}` samples read on every evaluation
    pub snapshot_path: String,
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        Self {
            snapshot_path: "~/.ruler/samples.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsSection {
    /// Alertmanager-compatible endpoint; alerts are only logged when unset
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
    /// Prometheus text dump written on shutdown
    pub metrics_file: Option<String>,
}

impl Default for NotificationsSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_seconds: 10,
            metrics_file: None,
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        // Surface a bad jitter name at load time rather than at startup
        config.scheduler.jitter.parse::<JitterStrategy>()?;
        Ok(config)
    }

    pub fn to_scheduler_config(&self) -> Result<SchedulerConfig> {
        let s = &self.scheduler;
        Ok(SchedulerConfig {
            base_interval: Duration::from_secs(s.base_interval_seconds.max(1)),
            jitter: s.jitter.parse()?,
            evaluation_timeout: Duration::from_secs(s.evaluation_timeout_seconds),
            resync_interval_ticks: s.resync_interval_ticks,
            default_rule_interval: Duration::from_secs(s.default_rule_interval_seconds),
        })
    }

    pub fn to_state_config(&self) -> StateConfig {
        StateConfig {
            resend_delay: Duration::from_secs(self.state.resend_delay_seconds),
            max_results_window: self.state.max_results_window.max(1),
        }
    }

    pub fn to_database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            max_connections: self.database.max_connections.max(1),
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_seconds),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_path_gives_defaults() {
        let config = Config::load(None).unwrap();
        let scheduler = config.to_scheduler_config().unwrap();
        assert_eq!(scheduler.base_interval, Duration::from_secs(10));
        assert_eq!(scheduler.jitter, JitterStrategy::Never);
        assert_eq!(config.to_state_config().resend_delay, Duration::from_secs(30));
        assert!(config.notifications.webhook_url.is_none());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
base_interval_seconds = 5
jitter = "by_rule"

[state]
resend_delay_seconds = 120

[notifications]
webhook_url = "http://localhost:9093/api/v2/alerts"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        let scheduler = config.to_scheduler_config().unwrap();
        assert_eq!(scheduler.base_interval, Duration::from_secs(5));
        assert_eq!(scheduler.jitter, JitterStrategy::ByRule);
        assert_eq!(scheduler.resync_interval_ticks, 30);

        let state = config.to_state_config();
        assert_eq!(state.resend_delay, Duration::from_secs(120));
        assert_eq!(state.max_results_window, 10);
        assert_eq!(
            config.notifications.webhook_url.as_deref(),
            Some("http://localhost:9093/api/v2/alerts")
        );
    }

    #[test]
    fn test_unknown_jitter_is_rejected() {
        let err = Config::parse("[scheduler]\njitter = \"sometimes\"\n").unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
