//! YAML rule group files used by `ruler rules apply`

use anyhow::{bail, Result};
use ruler_core::{
    AlertQuery, AlertRule, AlertRuleGroupKey, ExecErrState, Labels, NoDataState,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// A whole rule group. The file is the desired state of the group: rules
/// missing from it are deleted.
#[derive(Debug, Deserialize)]
pub struct RuleGroupFile {
    #[serde(default = "default_org")]
    pub org_id: i64,
    pub namespace: String,
    pub group: String,
    /// Evaluation interval shared by every rule of the group
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

fn default_org() -> i64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub uid: String,
    pub title: String,
    /// Shorthand for a single query `A` with this expression
    pub expr: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub data: Vec<AlertQuery>,
    #[serde(default, rename = "for")]
    pub for_seconds: i64,
    #[serde(default)]
    pub no_data_state: NoDataState,
    #[serde(default)]
    pub exec_err_state: ExecErrState,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub paused: bool,
}

impl RuleGroupFile {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn group_key(&self) -> AlertRuleGroupKey {
        AlertRuleGroupKey::new(self.org_id, self.namespace.clone(), self.group.clone())
    }

    /// Build the submitted rules
    ///
    /// Rules that already exist take their stored version, so applying the
    /// same file twice is a no-op rather than a conflict.
    pub fn into_rules(
        self,
        default_interval_seconds: i64,
        stored_versions: &HashMap<String, i64>,
    ) -> Result<Vec<AlertRule>> {
        let group_key = self.group_key();
        let interval = self.interval_seconds.unwrap_or(default_interval_seconds);

        let mut rules = Vec::with_capacity(self.rules.len());
        for entry in self.rules {
            let mut rule = match (&entry.expr, entry.data.is_empty()) {
                (Some(expr), true) => AlertRule::new(&group_key, entry.title.clone(), expr.clone()),
                (None, false) => {
                    let mut rule = AlertRule::new(&group_key, entry.title.clone(), "");
                    rule.condition = entry
                        .condition
                        .clone()
                        .unwrap_or_else(|| entry.data[0].ref_id.clone());
                    rule.data = entry.data;
                    rule
                }
                (Some(_), false) => bail!("Rule '{}' sets both expr and data", entry.title),
                (None, true) => bail!("Rule '{}' has neither expr nor data", entry.title),
            };
            if let Some(version) = stored_versions.get(&entry.uid) {
                rule.version = *version;
            }
            rule.uid = entry.uid;
            rule.interval_seconds = interval;
            rule.for_seconds = entry.for_seconds;
            rule.no_data_state = entry.no_data_state;
            rule.exec_err_state = entry.exec_err_state;
            rule.labels = entry.labels;
            rule.annotations = entry.annotations;
            rule.is_paused = entry.paused;
            rules.push(rule);
        }
        Ok(rules)
    }
}
