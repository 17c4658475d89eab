//! Persistent rule and instance stores
//!
//! The scheduler only talks to these traits. [`crate::database::Database`]
//! implements both on SQLite; [`memory`] provides in-process versions with the
//! same conflict semantics.

pub mod memory;

use async_trait::async_trait;

use crate::rule::{AlertRule, AlertRuleGroupKey};
use crate::rule_group::GroupDelta;
use crate::state::{AlertInstance, InstanceKey};
use crate::Result;

pub use memory::{MemoryInstanceStore, MemoryRuleStore};

/// Selects rules in [`RuleStore::list_rules`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub org_id: Option<i64>,
    pub namespace_uid: Option<String>,
    pub rule_group: Option<String>,
    pub uids: Vec<String>,
}

impl RuleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn group(key: &AlertRuleGroupKey) -> Self {
        Self {
            org_id: Some(key.org_id),
            namespace_uid: Some(key.namespace_uid.clone()),
            rule_group: Some(key.rule_group.clone()),
            uids: Vec::new(),
        }
    }

    pub fn uid(org_id: i64, uid: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id),
            uids: vec![uid.into()],
            ..Default::default()
        }
    }

    pub fn matches(&self, rule: &AlertRule) -> bool {
        self.org_id.map_or(true, |o| o == rule.org_id)
            && self
                .namespace_uid
                .as_ref()
                .map_or(true, |n| *n == rule.namespace_uid)
            && self.rule_group.as_ref().map_or(true, |g| *g == rule.rule_group)
            && (self.uids.is_empty() || self.uids.contains(&rule.uid))
    }
}

/// One optimistic update: `new` replaces `existing` only if the stored
/// version still equals `existing.version`
#[derive(Debug, Clone)]
pub struct RuleUpdate {
    pub existing: AlertRule,
    pub new: AlertRule,
}

/// What a group commit actually wrote
#[derive(Debug, Clone, Default)]
pub struct CommittedChanges {
    pub inserted: Vec<AlertRule>,
    pub updated: Vec<RuleUpdate>,
    pub deleted: Vec<AlertRule>,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules matching the filter, ordered by org, namespace, group and index
    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>>;

    /// Insert new rules, assigning ids, missing UIDs and version 1
    async fn insert_rules(&self, rules: Vec<AlertRule>) -> Result<Vec<AlertRule>>;

    /// Apply updates atomically; any version mismatch aborts all of them
    async fn update_rules(&self, updates: Vec<RuleUpdate>) -> Result<Vec<AlertRule>>;

    async fn delete_rules_by_uid(&self, org_id: i64, uids: &[String]) -> Result<()>;

    /// Apply a whole group delta atomically
    async fn commit_group_changes(&self, delta: &GroupDelta) -> Result<CommittedChanges>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn list_instances(&self, org_id: i64) -> Result<Vec<AlertInstance>>;

    async fn upsert_instances(&self, instances: &[AlertInstance]) -> Result<()>;

    async fn delete_instances(&self, keys: &[InstanceKey]) -> Result<()>;
}
