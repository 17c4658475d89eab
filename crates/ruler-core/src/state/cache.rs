//! In-memory alert instance store
//!
//! Instances are sharded per rule: the outer map lock is only held to find a
//! rule's shard, so reconciliation of different rules never contends. Readers
//! receive clones, so an instance is always observed whole.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::AlertInstance;
use crate::labels::{Fingerprint, Labels};
use crate::rule::AlertRuleKey;

type RuleShard = Arc<RwLock<HashMap<Fingerprint, AlertInstance>>>;

/// Alert instances keyed by rule, then by label fingerprint
#[derive(Default)]
pub struct StateCache {
    rules: RwLock<HashMap<AlertRuleKey, RuleShard>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, key: &AlertRuleKey) -> Option<RuleShard> {
        self.rules.read().get(key).cloned()
    }

    fn shard_or_create(&self, key: &AlertRuleKey) -> RuleShard {
        if let Some(shard) = self.shard(key) {
            return shard;
        }
        self.rules.write().entry(key.clone()).or_default().clone()
    }

    /// Existing instance for the series, or a fresh `Normal` one (not stored)
    pub fn get_or_create(&self, rule: &AlertRuleKey, labels: &Labels, now: DateTime<Utc>) -> AlertInstance {
        let fingerprint = Fingerprint::of(labels);
        self.get(rule, fingerprint)
            .unwrap_or_else(|| AlertInstance::new(rule, labels.clone(), now))
    }

    pub fn get(&self, rule: &AlertRuleKey, fingerprint: Fingerprint) -> Option<AlertInstance> {
        self.shard(rule)?.read().get(&fingerprint).cloned()
    }

    /// Insert or replace an instance
    pub fn set(&self, instance: AlertInstance) {
        let key = AlertRuleKey::new(instance.org_id, instance.rule_uid.clone());
        self.shard_or_create(&key)
            .write()
            .insert(instance.fingerprint, instance);
    }

    /// Apply `f` to a stored instance, returning the updated copy
    pub fn update<F>(&self, rule: &AlertRuleKey, fingerprint: Fingerprint, f: F) -> Option<AlertInstance>
    where
        F: FnOnce(&mut AlertInstance),
    {
        let shard = self.shard(rule)?;
        let mut guard = shard.write();
        let instance = guard.get_mut(&fingerprint)?;
        f(instance);
        Some(instance.clone())
    }

    pub fn delete(&self, rule: &AlertRuleKey, fingerprint: Fingerprint) -> Option<AlertInstance> {
        self.shard(rule)?.write().remove(&fingerprint)
    }

    /// Remove every instance of a rule
    pub fn remove_rule(&self, rule: &AlertRuleKey) -> Vec<AlertInstance> {
        let shard = self.rules.write().remove(rule);
        let mut removed: Vec<AlertInstance> = match shard {
            Some(shard) => {
                let mut guard = shard.write();
                guard.drain().map(|(_, v)| v).collect()
            }
            None => Vec::new(),
        };
        removed.sort_by(|a, b| a.labels.cmp(&b.labels));
        removed
    }

    /// Remove and return instances of `rule` not in `seen` whose last
    /// evaluation is more than `threshold` before `now`
    pub fn sweep_stale(
        &self,
        rule: &AlertRuleKey,
        seen: &HashSet<Fingerprint>,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Vec<AlertInstance> {
        let Some(shard) = self.shard(rule) else {
            return Vec::new();
        };
        let mut guard = shard.write();
        let stale: Vec<Fingerprint> = guard
            .values()
            .filter(|i| !seen.contains(&i.fingerprint))
            .filter(|i| now - i.last_evaluation_time > threshold)
            .map(|i| i.fingerprint)
            .collect();

        let mut removed: Vec<AlertInstance> =
            stale.iter().filter_map(|fp| guard.remove(fp)).collect();
        removed.sort_by(|a, b| a.labels.cmp(&b.labels));
        removed
    }

    /// Snapshot of a rule's instances, in label order
    pub fn get_for_rule(&self, rule: &AlertRuleKey) -> Vec<AlertInstance> {
        let mut instances: Vec<AlertInstance> = match self.shard(rule) {
            Some(shard) => {
                let guard = shard.read();
                guard.values().cloned().collect()
            }
            None => Vec::new(),
        };
        instances.sort_by(|a, b| a.labels.cmp(&b.labels));
        instances
    }

    /// Snapshot of an organization's instances, ordered by rule then labels
    pub fn get_all(&self, org_id: i64) -> Vec<AlertInstance> {
        let mut shards: Vec<(AlertRuleKey, RuleShard)> = self
            .rules
            .read()
            .iter()
            .filter(|(k, _)| k.org_id == org_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        shards.sort_by(|a, b| a.0.cmp(&b.0));

        shards
            .into_iter()
            .flat_map(|(_, shard)| {
                let mut instances: Vec<AlertInstance> = shard.read().values().cloned().collect();
                instances.sort_by(|a, b| a.labels.cmp(&b.labels));
                instances
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().values().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
