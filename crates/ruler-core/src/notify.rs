//! Notification forwarding
//!
//! Converts alert instances that are due for (re-)notification into
//! Alertmanager-compatible alerts and hands them to a
//! [`NotificationForwarder`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::labels::{merge, Labels};
use crate::rule::AlertRule;
use crate::state::{AlertInstance, AlertState};
use crate::{Error, Result};

pub const RULE_UID_LABEL: &str = "__alert_rule_uid__";
pub const ALERTNAME_LABEL: &str = "alertname";
pub const RULENAME_LABEL: &str = "rulename";
pub const NAMESPACE_UID_LABEL: &str = "__alert_rule_namespace_uid__";

/// An alert ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedAlert {
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(rename = "generatorURL", skip_serializing_if = "String::is_empty")]
    pub generator_url: String,
}

impl FinalizedAlert {
    /// Build the delivered alert from a rule and one of its instances
    pub fn from_instance(rule: &AlertRule, instance: &AlertInstance) -> Self {
        let mut labels = merge(&rule.labels, &instance.labels);
        labels.insert(RULE_UID_LABEL.to_string(), rule.uid.clone());
        labels.insert(NAMESPACE_UID_LABEL.to_string(), rule.namespace_uid.clone());
        let alertname = match instance.state() {
            AlertState::NoData => "DatasourceNoData".to_string(),
            AlertState::Error => "DatasourceError".to_string(),
            _ => rule.title.clone(),
        };
        if instance.state() == AlertState::NoData || instance.state() == AlertState::Error {
            labels.insert(RULENAME_LABEL.to_string(), rule.title.clone());
        }
        labels.insert(ALERTNAME_LABEL.to_string(), alertname);

        let mut annotations = rule.annotations.clone();
        if let Some(error) = &instance.error {
            annotations.insert("Error".to_string(), error.clone());
        }
        if let Some(settings) = &rule.notification_settings {
            annotations.insert("__receiver__".to_string(), settings.receiver.clone());
        }

        Self {
            labels,
            annotations,
            starts_at: instance.starts_at,
            ends_at: instance.ends_at,
            generator_url: String::new(),
        }
    }

    pub fn is_resolved(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }
}

/// Whether an instance should be (re-)sent at `now`
///
/// Pending instances have not fired yet and are never sent. A resolved
/// instance is sent until the delivery clears its `resolved` flag. Firing
/// instances are sent when they changed state or when `resend_delay` has
/// passed since the last delivery.
pub fn needs_sending(
    instance: &AlertInstance,
    state_changed: bool,
    resend_delay: Duration,
    now: DateTime<Utc>,
) -> bool {
    match instance.state() {
        AlertState::Pending => false,
        AlertState::Normal => {
            instance.resolved
                && match (instance.last_sent_at, instance.resolved_at) {
                    (None, _) => true,
                    (Some(sent), Some(resolved)) => sent <= resolved,
                    (Some(_), None) => false,
                }
        }
        _ => {
            if state_changed {
                return true;
            }
            match instance.last_sent_at {
                None => true,
                Some(sent) => {
                    let delay = chrono::Duration::from_std(resend_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    now - sent >= delay
                }
            }
        }
    }
}

#[async_trait]
pub trait NotificationForwarder: Send + Sync {
    async fn send(&self, alerts: Vec<FinalizedAlert>) -> Result<()>;
}

/// Writes alerts to the log instead of delivering them
pub struct LogForwarder;

#[async_trait]
impl NotificationForwarder for LogForwarder {
    async fn send(&self, alerts: Vec<FinalizedAlert>) -> Result<()> {
        let now = Utc::now();
        for alert in alerts {
            info!(
                alertname = alert.labels.get(ALERTNAME_LABEL).map(String::as_str).unwrap_or(""),
                rule_uid = alert.labels.get(RULE_UID_LABEL).map(String::as_str).unwrap_or(""),
                resolved = alert.is_resolved(now),
                starts_at = %alert.starts_at,
                ends_at = %alert.ends_at,
                "Forwarding alert"
            );
        }
        Ok(())
    }
}

/// Posts alerts to an Alertmanager-compatible `/api/v2/alerts` endpoint
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::Config(format!(
                "Webhook URL must be http(s): {}",
                url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationForwarder for WebhookForwarder {
    async fn send(&self, alerts: Vec<FinalizedAlert>) -> Result<()> {
        if alerts.is_empty() {
            return Ok(());
        }
        debug!(count = alerts.len(), url = %self.url, "Posting alerts");
        let response = self
            .client
            .post(&self.url)
            .json(&alerts)
            .send()
            .await
            .map_err(|e| Error::Other(format!("Failed to send alerts: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "Alert receiver returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalState;
    use crate::rule::{AlertRuleGroupKey, AlertRuleKey};
    use crate::state::{StateReason, Status};

    fn rule() -> AlertRule {
        AlertRule::new(&AlertRuleGroupKey::new(1, "ns", "g"), "High CPU", "cpu > 90")
            .with_uid("rule-1")
            .with_label("severity", "critical")
    }

    fn instance(state: AlertState, reason: StateReason) -> AlertInstance {
        let mut labels = Labels::new();
        labels.insert("host".to_string(), "a".to_string());
        let mut instance = AlertInstance::new(&AlertRuleKey::new(1, "rule-1"), labels, Utc::now());
        instance.status = Status::new(state, reason).unwrap();
        instance
    }

    #[test]
    fn test_finalized_alert_labels() {
        let alert = FinalizedAlert::from_instance(
            &rule(),
            &instance(AlertState::Alerting, StateReason::Evaluated(EvalState::Alerting)),
        );
        assert_eq!(alert.labels[ALERTNAME_LABEL], "High CPU");
        assert_eq!(alert.labels[RULE_UID_LABEL], "rule-1");
        assert_eq!(alert.labels["severity"], "critical");
        assert_eq!(alert.labels["host"], "a");

        let no_data = FinalizedAlert::from_instance(
            &rule(),
            &instance(AlertState::NoData, StateReason::Evaluated(EvalState::NoData)),
        );
        assert_eq!(no_data.labels[ALERTNAME_LABEL], "DatasourceNoData");
        assert_eq!(no_data.labels[RULENAME_LABEL], "High CPU");
    }

    #[test]
    fn test_finalized_alert_json_shape() {
        let alert = FinalizedAlert::from_instance(
            &rule(),
            &instance(AlertState::Alerting, StateReason::Evaluated(EvalState::Alerting)),
        );
        let json = serde_json::to_value(&alert).unwrap();
        assert!(json.get("startsAt").is_some());
        assert!(json.get("endsAt").is_some());
        assert!(json.get("generatorURL").is_none());
    }

    #[test]
    fn test_pending_is_never_sent() {
        let pending = instance(AlertState::Pending, StateReason::Evaluated(EvalState::Alerting));
        assert!(!needs_sending(&pending, true, Duration::from_secs(30), Utc::now()));
    }

    #[test]
    fn test_resend_delay() {
        let now = Utc::now();
        let mut firing = instance(AlertState::Alerting, StateReason::Evaluated(EvalState::Alerting));
        assert!(needs_sending(&firing, false, Duration::from_secs(30), now));

        firing.last_sent_at = Some(now - chrono::Duration::seconds(10));
        assert!(!needs_sending(&firing, false, Duration::from_secs(30), now));
        assert!(needs_sending(&firing, true, Duration::from_secs(30), now));

        firing.last_sent_at = Some(now - chrono::Duration::seconds(30));
        assert!(needs_sending(&firing, false, Duration::from_secs(30), now));
    }

    #[test]
    fn test_resolved_is_sent_once() {
        let now = Utc::now();
        let mut normal = instance(AlertState::Normal, StateReason::Evaluated(EvalState::Normal));
        assert!(!needs_sending(&normal, true, Duration::from_secs(30), now));

        normal.resolved = true;
        normal.resolved_at = Some(now);
        normal.last_sent_at = Some(now - chrono::Duration::seconds(5));
        assert!(needs_sending(&normal, true, Duration::from_secs(30), now));

        normal.last_sent_at = Some(now);
        assert!(needs_sending(&normal, false, Duration::from_secs(30), now));

        normal.resolved = false;
        assert!(!needs_sending(&normal, false, Duration::from_secs(30), now));

        normal.resolved = true;
        normal.last_sent_at = Some(now + chrono::Duration::seconds(1));
        assert!(!needs_sending(&normal, false, Duration::from_secs(30), now));
    }

    #[test]
    fn test_webhook_url_validation() {
        assert!(WebhookForwarder::new("ftp://example", Duration::from_secs(5)).is_err());
        assert!(WebhookForwarder::new("http://localhost:9093/api/v2/alerts", Duration::from_secs(5)).is_ok());
    }
}
