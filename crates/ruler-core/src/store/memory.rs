//! In-process stores, used by tests and by `ruler run --memory`

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{CommittedChanges, InstanceStore, RuleFilter, RuleStore, RuleUpdate};
use crate::rule::{AlertRule, AlertRuleKey};
use crate::rule_group::{verify_group_snapshot, GroupDelta};
use crate::state::{AlertInstance, InstanceKey};
use crate::{Error, Result};

#[derive(Default)]
struct RuleTable {
    next_id: i64,
    rules: HashMap<AlertRuleKey, AlertRule>,
}

impl RuleTable {
    fn insert(&mut self, mut rule: AlertRule) -> Result<AlertRule> {
        if rule.uid.is_empty() {
            rule.uid = uuid::Uuid::new_v4().simple().to_string();
        }
        if self.rules.contains_key(&rule.key()) {
            return Err(Error::DuplicateUid(rule.uid));
        }
        self.next_id += 1;
        rule.id = self.next_id;
        rule.version = 1;
        rule.updated = Utc::now();
        self.rules.insert(rule.key(), rule.clone());
        Ok(rule)
    }

    fn check_version(&self, update: &RuleUpdate) -> Result<()> {
        let current = self
            .rules
            .get(&update.existing.key())
            .ok_or_else(|| Error::RuleNotFound(update.existing.uid.clone()))?;
        if current.version != update.existing.version {
            return Err(Error::VersionConflict {
                uid: current.uid.clone(),
                expected: update.existing.version,
                actual: current.version,
            });
        }
        Ok(())
    }

    fn apply_update(&mut self, update: &RuleUpdate) -> AlertRule {
        let mut rule = update.new.clone();
        rule.id = update.existing.id;
        rule.uid = update.existing.uid.clone();
        rule.version = update.existing.version + 1;
        rule.updated = Utc::now();
        self.rules.insert(rule.key(), rule.clone());
        rule
    }
}

/// Rule store backed by a mutex-guarded map
///
/// Every operation runs under one lock, which makes group commits atomic.
#[derive(Default)]
pub struct MemoryRuleStore {
    table: Mutex<RuleTable>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_rules(rules: &mut [AlertRule]) {
    rules.sort_by(|a, b| {
        (a.org_id, &a.namespace_uid, &a.rule_group, a.rule_group_index, &a.uid).cmp(&(
            b.org_id,
            &b.namespace_uid,
            &b.rule_group,
            b.rule_group_index,
            &b.uid,
        ))
    });
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>> {
        let table = self.table.lock();
        let mut rules: Vec<AlertRule> = table
            .rules
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_rules(&mut rules);
        Ok(rules)
    }

    async fn insert_rules(&self, rules: Vec<AlertRule>) -> Result<Vec<AlertRule>> {
        let mut table = self.table.lock();
        for rule in &rules {
            if !rule.uid.is_empty() && table.rules.contains_key(&rule.key()) {
                return Err(Error::DuplicateUid(rule.uid.clone()));
            }
        }
        rules.into_iter().map(|r| table.insert(r)).collect()
    }

    async fn update_rules(&self, updates: Vec<RuleUpdate>) -> Result<Vec<AlertRule>> {
        let mut table = self.table.lock();
        for update in &updates {
            table.check_version(update)?;
        }
        Ok(updates.iter().map(|u| table.apply_update(u)).collect())
    }

    async fn delete_rules_by_uid(&self, org_id: i64, uids: &[String]) -> Result<()> {
        let mut table = self.table.lock();
        for uid in uids {
            table.rules.remove(&AlertRuleKey::new(org_id, uid.clone()));
        }
        Ok(())
    }

    async fn commit_group_changes(&self, delta: &GroupDelta) -> Result<CommittedChanges> {
        let mut table = self.table.lock();

        let current: Vec<AlertRule> = table
            .rules
            .values()
            .filter(|r| r.group_key() == delta.group_key)
            .cloned()
            .collect();
        verify_group_snapshot(delta, &current)?;

        let updates: Vec<RuleUpdate> = delta
            .update
            .iter()
            .map(|d| RuleUpdate {
                existing: d.existing.clone(),
                new: d.new.clone(),
            })
            .collect();
        for update in &updates {
            table.check_version(update)?;
        }
        for rule in &delta.delete {
            let current = table
                .rules
                .get(&rule.key())
                .ok_or_else(|| Error::RuleNotFound(rule.uid.clone()))?;
            if current.version != rule.version {
                return Err(Error::VersionConflict {
                    uid: rule.uid.clone(),
                    expected: rule.version,
                    actual: current.version,
                });
            }
        }
        for rule in &delta.new {
            if !rule.uid.is_empty() && table.rules.contains_key(&rule.key()) {
                return Err(Error::DuplicateUid(rule.uid.clone()));
            }
        }

        // All checks passed, nothing below can fail
        let mut committed = CommittedChanges::default();
        for rule in &delta.delete {
            if let Some(removed) = table.rules.remove(&rule.key()) {
                committed.deleted.push(removed);
            }
        }
        for update in updates {
            let new = table.apply_update(&update);
            committed.updated.push(RuleUpdate {
                existing: update.existing,
                new,
            });
        }
        for rule in &delta.new {
            committed.inserted.push(table.insert(rule.clone())?);
        }
        Ok(committed)
    }
}

/// Instance store backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: Mutex<BTreeMap<InstanceKey, AlertInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn list_instances(&self, org_id: i64) -> Result<Vec<AlertInstance>> {
        Ok(self
            .instances
            .lock()
            .values()
            .filter(|i| i.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn upsert_instances(&self, instances: &[AlertInstance]) -> Result<()> {
        let mut map = self.instances.lock();
        for instance in instances {
            map.insert(instance.key(), instance.clone());
        }
        Ok(())
    }

    async fn delete_instances(&self, keys: &[InstanceKey]) -> Result<()> {
        let mut map = self.instances.lock();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }
}
