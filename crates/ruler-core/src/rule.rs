//! Alert rule definitions
//!
//! This module provides the rule data model:
//! - Rule and rule-group identity keys
//! - No-data and execution-error policies
//! - Queries and notification settings
//! - Submission-time validation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::Labels;
use crate::{Error, Result};

/// Maximum length of a rule UID
pub const MAX_UID_LENGTH: usize = 40;

/// Longest accepted evaluation interval and for-duration, one year
pub const MAX_INTERVAL_SECONDS: i64 = 365 * 24 * 60 * 60;

/// Identity of a rule: `(org_id, uid)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertRuleKey {
    pub org_id: i64,
    pub uid: String,
}

impl AlertRuleKey {
    pub fn new(org_id: i64, uid: impl Into<String>) -> Self {
        Self {
            org_id,
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for AlertRuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "org_id={}, uid={}", self.org_id, self.uid)
    }
}

/// Identity of a rule group: `(org_id, namespace_uid, rule_group)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertRuleGroupKey {
    pub org_id: i64,
    pub namespace_uid: String,
    pub rule_group: String,
}

impl AlertRuleGroupKey {
    pub fn new(
        org_id: i64,
        namespace_uid: impl Into<String>,
        rule_group: impl Into<String>,
    ) -> Self {
        Self {
            org_id,
            namespace_uid: namespace_uid.into(),
            rule_group: rule_group.into(),
        }
    }
}

impl std::fmt::Display for AlertRuleGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "org_id={}, namespace_uid={}, rule_group={}",
            self.org_id, self.namespace_uid, self.rule_group
        )
    }
}

/// What to do when a rule's queries return no data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoDataState {
    Alerting,
    #[default]
    NoData,
    #[serde(rename = "OK")]
    Ok,
    KeepLast,
}

impl NoDataState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alerting => "Alerting",
            Self::NoData => "NoData",
            Self::Ok => "OK",
            Self::KeepLast => "KeepLast",
        }
    }
}

impl std::fmt::Display for NoDataState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NoDataState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Alerting" => Ok(Self::Alerting),
            "NoData" => Ok(Self::NoData),
            "OK" => Ok(Self::Ok),
            "KeepLast" => Ok(Self::KeepLast),
            _ => Err(Error::Parse(format!("Invalid no-data state: {}", s))),
        }
    }
}

/// What to do when evaluating a rule fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecErrState {
    #[default]
    Alerting,
    Error,
    #[serde(rename = "OK")]
    Ok,
    KeepLast,
}

impl ExecErrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alerting => "Alerting",
            Self::Error => "Error",
            Self::Ok => "OK",
            Self::KeepLast => "KeepLast",
        }
    }
}

impl std::fmt::Display for ExecErrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecErrState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Alerting" => Ok(Self::Alerting),
            "Error" => Ok(Self::Error),
            "OK" => Ok(Self::Ok),
            "KeepLast" => Ok(Self::KeepLast),
            _ => Err(Error::Parse(format!("Invalid exec-error state: {}", s))),
        }
    }
}

/// Who manages a rule. Rules with a provenance other than `None` are locked
/// against edits coming from a different source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    #[default]
    None,
    Api,
    File,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Api => "api",
            Self::File => "file",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provenance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "api" => Ok(Self::Api),
            "file" => Ok(Self::File),
            _ => Err(Error::Parse(format!("Invalid provenance: {}", s))),
        }
    }
}

/// One data-source query of a rule. The model is opaque to the scheduler and
/// interpreted only by the condition evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertQuery {
    pub ref_id: String,
    #[serde(default)]
    pub datasource_uid: String,
    #[serde(default)]
    pub relative_time_range_seconds: i64,
    #[serde(default)]
    pub model: serde_json::Value,
}

impl AlertQuery {
    pub fn new(ref_id: impl Into<String>, model: serde_json::Value) -> Self {
        Self {
            ref_id: ref_id.into(),
            datasource_uid: String::new(),
            relative_time_range_seconds: 600,
            model,
        }
    }
}

/// Per-rule notification routing overrides
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub receiver: String,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub repeat_interval_seconds: Option<i64>,
}

/// Alert rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRule {
    pub id: i64,
    pub org_id: i64,
    pub uid: String,
    pub title: String,
    /// `ref_id` of the query whose result decides the alert state
    pub condition: String,
    pub data: Vec<AlertQuery>,
    pub updated: DateTime<Utc>,
    pub interval_seconds: i64,
    /// Optimistic-lock token, incremented on every successful update
    pub version: i64,
    pub namespace_uid: String,
    pub rule_group: String,
    pub rule_group_index: i32,
    pub no_data_state: NoDataState,
    pub exec_err_state: ExecErrState,
    /// How long the condition must hold before Pending becomes Alerting
    pub for_seconds: i64,
    pub annotations: BTreeMap<String, String>,
    pub labels: Labels,
    pub is_paused: bool,
    pub notification_settings: Option<NotificationSettings>,
    pub provenance: Provenance,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            id: 0,
            org_id: 1,
            uid: String::new(),
            title: String::new(),
            condition: String::new(),
            data: Vec::new(),
            updated: Utc::now(),
            interval_seconds: 60,
            version: 0,
            namespace_uid: String::new(),
            rule_group: String::new(),
            rule_group_index: 0,
            no_data_state: NoDataState::default(),
            exec_err_state: ExecErrState::default(),
            for_seconds: 0,
            annotations: BTreeMap::new(),
            labels: Labels::new(),
            is_paused: false,
            notification_settings: None,
            provenance: Provenance::None,
        }
    }
}

impl AlertRule {
    /// Create a new rule in a group, with a single query `A` used as condition
    pub fn new(group: &AlertRuleGroupKey, title: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            org_id: group.org_id,
            namespace_uid: group.namespace_uid.clone(),
            rule_group: group.rule_group.clone(),
            title: title.into(),
            condition: "A".to_string(),
            data: vec![AlertQuery::new(
                "A",
                serde_json::json!({ "expr": expr.into() }),
            )],
            ..Default::default()
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_interval(mut self, interval_seconds: i64) -> Self {
        self.interval_seconds = interval_seconds;
        self
    }

    pub fn with_for(mut self, for_seconds: i64) -> Self {
        self.for_seconds = for_seconds;
        self
    }

    pub fn with_no_data_state(mut self, state: NoDataState) -> Self {
        self.no_data_state = state;
        self
    }

    pub fn with_exec_err_state(mut self, state: ExecErrState) -> Self {
        self.exec_err_state = state;
        self
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.is_paused = paused;
        self
    }

    pub fn key(&self) -> AlertRuleKey {
        AlertRuleKey::new(self.org_id, self.uid.clone())
    }

    pub fn group_key(&self) -> AlertRuleGroupKey {
        AlertRuleGroupKey::new(self.org_id, self.namespace_uid.clone(), self.rule_group.clone())
    }

    /// Number of scheduler ticks between two evaluations of this rule
    pub fn ticks_per_interval(&self, base_interval_seconds: i64) -> i64 {
        if base_interval_seconds <= 0 {
            return 1;
        }
        (self.interval_seconds / base_interval_seconds).max(1)
    }

    /// Whether an update to `other` changes how the rule evaluates, as opposed
    /// to only its presentation (title, labels, annotations, index).
    pub fn evaluation_changed(&self, other: &AlertRule) -> bool {
        self.condition != other.condition
            || self.data != other.data
            || self.interval_seconds != other.interval_seconds
            || self.for_seconds != other.for_seconds
            || self.no_data_state != other.no_data_state
            || self.exec_err_state != other.exec_err_state
            || self.is_paused != other.is_paused
    }

    /// Validate the rule against the scheduler's base interval
    pub fn validate(&self, base_interval_seconds: i64) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("Rule title cannot be empty".to_string()));
        }
        if self.uid.len() > MAX_UID_LENGTH {
            return Err(Error::Validation(format!(
                "Rule UID '{}' is longer than {} characters",
                self.uid, MAX_UID_LENGTH
            )));
        }
        if self.namespace_uid.is_empty() || self.rule_group.is_empty() {
            return Err(Error::Validation(format!(
                "Rule '{}' must belong to a namespace and a group",
                self.title
            )));
        }
        if self.interval_seconds <= 0
            || self.interval_seconds > MAX_INTERVAL_SECONDS
            || base_interval_seconds <= 0
            || self.interval_seconds % base_interval_seconds != 0
        {
            return Err(Error::InvalidInterval {
                uid: self.uid.clone(),
                interval_seconds: self.interval_seconds,
                base_seconds: base_interval_seconds,
            });
        }
        if self.condition.is_empty() || !self.data.iter().any(|q| q.ref_id == self.condition) {
            let id = if self.uid.is_empty() { &self.title } else { &self.uid };
            return Err(Error::MissingCondition(id.clone()));
        }
        if !(0..=MAX_INTERVAL_SECONDS).contains(&self.for_seconds) {
            return Err(Error::Validation(format!(
                "Rule '{}' has a for-duration outside 0..={} seconds",
                self.title, MAX_INTERVAL_SECONDS
            )));
        }
        if self.labels.keys().any(|k| k.is_empty()) {
            return Err(Error::Validation(format!(
                "Rule '{}' has a label with an empty name",
                self.title
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn group() -> AlertRuleGroupKey {
        AlertRuleGroupKey::new(1, "ns-1", "group-a")
    }

    #[test]
    fn test_alert_rule_creation() {
        let rule = AlertRule::new(&group(), "high-cpu", "cpu_usage > 90").with_interval(30);

        assert_eq!(rule.org_id, 1);
        assert_eq!(rule.rule_group, "group-a");
        assert_eq!(rule.condition, "A");
        assert_eq!(rule.data.len(), 1);
        assert_eq!(rule.interval_seconds, 30);
        assert_eq!(rule.group_key(), group());
        assert!(rule.validate(10).is_ok());
    }

    #[test]
    fn test_validate_interval() {
        let rule = AlertRule::new(&group(), "r", "x > 1").with_interval(15);
        let err = rule.validate(10).unwrap_err();
        assert!(matches!(err, Error::InvalidInterval { .. }));
        assert!(err.is_validation());

        let rule = AlertRule::new(&group(), "r", "x > 1").with_interval(0);
        assert!(matches!(
            rule.validate(10).unwrap_err(),
            Error::InvalidInterval { .. }
        ));
    }

    #[test]
    fn test_validate_interval_upper_bound() {
        let longest = AlertRule::new(&group(), "r", "x > 1").with_interval(MAX_INTERVAL_SECONDS);
        assert!(longest.validate(10).is_ok());

        let rule = AlertRule::new(&group(), "r", "x > 1")
            .with_interval(MAX_INTERVAL_SECONDS + 10);
        assert!(matches!(
            rule.validate(10).unwrap_err(),
            Error::InvalidInterval { .. }
        ));

        let rule = AlertRule::new(&group(), "r", "x > 1").with_interval(10_000_000_000_000_000);
        assert!(rule.validate(10).is_err());

        let rule = AlertRule::new(&group(), "r", "x > 1")
            .with_interval(10)
            .with_for(MAX_INTERVAL_SECONDS + 1);
        assert!(rule.validate(10).unwrap_err().is_validation());
    }

    #[test]
    fn test_validate_condition_must_reference_query() {
        let mut rule = AlertRule::new(&group(), "r", "x > 1").with_interval(10);
        rule.condition = "B".to_string();
        assert!(matches!(
            rule.validate(10).unwrap_err(),
            Error::MissingCondition(_)
        ));

        rule.condition.clear();
        assert!(matches!(
            rule.validate(10).unwrap_err(),
            Error::MissingCondition(_)
        ));
    }

    #[test]
    fn test_validate_title_and_uid() {
        let rule = AlertRule::new(&group(), "  ", "x > 1").with_interval(10);
        assert!(rule.validate(10).is_err());

        let rule = AlertRule::new(&group(), "r", "x > 1")
            .with_interval(10)
            .with_uid("u".repeat(MAX_UID_LENGTH + 1));
        assert!(rule.validate(10).is_err());
    }

    #[test]
    fn test_ticks_per_interval() {
        let rule = AlertRule::new(&group(), "r", "x > 1").with_interval(60);
        assert_eq!(rule.ticks_per_interval(10), 6);
        assert_eq!(rule.ticks_per_interval(60), 1);
    }

    #[test]
    fn test_evaluation_changed() {
        let rule = AlertRule::new(&group(), "r", "x > 1").with_interval(60);

        let relabeled = rule.clone().with_label("team", "core");
        assert!(!rule.evaluation_changed(&relabeled));

        let slower = rule.clone().with_interval(120);
        assert!(rule.evaluation_changed(&slower));

        let paused = rule.clone().with_paused(true);
        assert!(rule.evaluation_changed(&paused));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(NoDataState::from_str("OK").unwrap(), NoDataState::Ok);
        assert_eq!(NoDataState::from_str("KeepLast").unwrap(), NoDataState::KeepLast);
        assert!(NoDataState::from_str("ok").is_err());
        assert_eq!(ExecErrState::from_str("Error").unwrap(), ExecErrState::Error);
        assert_eq!(Provenance::from_str("").unwrap(), Provenance::None);
        assert_eq!(Provenance::from_str("File").unwrap(), Provenance::File);
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let yaml = r#"
title: disk-full
condition: A
interval_seconds: 60
data:
  - ref_id: A
    model:
      expr: disk_used_percent > 95
no_data_state: OK
"#;
        let rule: AlertRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.title, "disk-full");
        assert_eq!(rule.no_data_state, NoDataState::Ok);
        assert_eq!(rule.exec_err_state, ExecErrState::Alerting);
        assert_eq!(rule.version, 0);
        assert!(rule.uid.is_empty());
    }
}
