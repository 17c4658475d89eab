//! Rule group change calculation
//!
//! Reconciles a submitted rule group against the persisted one:
//! - Rules without UID are inserted
//! - Rules with UID must already exist in the group and are updated when
//!   any field differs (including their position)
//! - Persisted rules missing from the submission are deleted
//! - Surviving rules are re-indexed densely in submission order
//!
//! The resulting [`GroupDelta`] is committed atomically by a
//! [`RuleStore`](crate::store::RuleStore) using each rule's version as an
//! optimistic lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::rule::{AlertRule, AlertRuleGroupKey, AlertRuleKey, Provenance};
use crate::store::{CommittedChanges, RuleFilter, RuleStore};
use crate::{Error, Result};

/// One differing field between two versions of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub path: &'static str,
    pub left: String,
    pub right: String,
}

/// Existing rule, its replacement, and what differs between them
#[derive(Debug, Clone)]
pub struct RuleDelta {
    pub existing: AlertRule,
    pub new: AlertRule,
    pub diff: Vec<FieldDiff>,
}

impl RuleDelta {
    /// True when only the group position changed
    pub fn index_only(&self) -> bool {
        self.diff.iter().all(|d| d.path == "rule_group_index")
    }
}

/// Changes needed to turn the persisted group into the submitted one
#[derive(Debug, Clone)]
pub struct GroupDelta {
    pub group_key: AlertRuleGroupKey,
    /// Every group touched by the change, with its persisted rules in index order
    pub affected_groups: BTreeMap<AlertRuleGroupKey, Vec<AlertRule>>,
    pub new: Vec<AlertRule>,
    pub update: Vec<RuleDelta>,
    pub delete: Vec<AlertRule>,
}

impl GroupDelta {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Field-by-field comparison, ignoring store-managed fields (id, version,
/// updated timestamp)
pub fn diff_rules(existing: &AlertRule, new: &AlertRule) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();

    macro_rules! compare {
        ($field:ident) => {
            if existing.$field != new.$field {
                diffs.push(FieldDiff {
                    path: stringify!($field),
                    left: format!("{:?}", existing.$field),
                    right: format!("{:?}", new.$field),
                });
            }
        };
    }

    compare!(org_id);
    compare!(uid);
    compare!(title);
    compare!(condition);
    compare!(data);
    compare!(interval_seconds);
    compare!(namespace_uid);
    compare!(rule_group);
    compare!(rule_group_index);
    compare!(no_data_state);
    compare!(exec_err_state);
    compare!(for_seconds);
    compare!(annotations);
    compare!(labels);
    compare!(is_paused);
    compare!(notification_settings);
    compare!(provenance);

    diffs
}

/// Compute the delta between the persisted rules of a group and a submission
pub fn calculate_changes(
    group_key: &AlertRuleGroupKey,
    existing: Vec<AlertRule>,
    submitted: Vec<AlertRule>,
    base_interval_seconds: i64,
) -> Result<GroupDelta> {
    let mut seen_uids = HashSet::new();
    for rule in &submitted {
        if !rule.uid.is_empty() && !seen_uids.insert(rule.uid.clone()) {
            return Err(Error::DuplicateUid(rule.uid.clone()));
        }
    }

    let mut existing_by_uid: HashMap<String, AlertRule> = existing
        .iter()
        .filter(|r| r.group_key() == *group_key)
        .map(|r| (r.uid.clone(), r.clone()))
        .collect();

    let mut new = Vec::new();
    let mut update = Vec::new();

    for (index, mut rule) in submitted.into_iter().enumerate() {
        rule.org_id = group_key.org_id;
        rule.namespace_uid = group_key.namespace_uid.clone();
        rule.rule_group = group_key.rule_group.clone();
        rule.rule_group_index = index as i32;
        rule.validate(base_interval_seconds)?;

        if rule.uid.is_empty() {
            new.push(rule);
            continue;
        }

        let current = existing_by_uid
            .remove(&rule.uid)
            .ok_or_else(|| Error::RuleNotFound(rule.uid.clone()))?;

        let diff = diff_rules(&current, &rule);
        if diff.is_empty() {
            continue;
        }
        if rule.version == 0 {
            return Err(Error::Validation(format!(
                "Update of rule {} must supply the version it was read at",
                rule.uid
            )));
        }
        if rule.version != current.version {
            return Err(Error::VersionConflict {
                uid: rule.uid.clone(),
                expected: rule.version,
                actual: current.version,
            });
        }

        rule.id = current.id;
        rule.updated = current.updated;
        update.push(RuleDelta {
            existing: current,
            new: rule,
            diff,
        });
    }

    let mut delete: Vec<AlertRule> = existing_by_uid.into_values().collect();
    delete.sort_by_key(|r| r.rule_group_index);

    // The group's snapshot is kept even for an empty delta, stores compare
    // it against the persisted group at commit time
    let mut group_rules: Vec<AlertRule> = existing
        .into_iter()
        .filter(|r| r.group_key() == *group_key)
        .collect();
    group_rules.sort_by_key(|r| r.rule_group_index);
    let mut affected_groups = BTreeMap::new();
    affected_groups.insert(group_key.clone(), group_rules);

    debug!(
        group = %group_key,
        new = new.len(),
        update = update.len(),
        delete = delete.len(),
        "Calculated rule group changes"
    );

    Ok(GroupDelta {
        group_key: group_key.clone(),
        affected_groups,
        new,
        update,
        delete,
    })
}

/// Check that the persisted rules of the delta's group still match the
/// snapshot the delta was computed from
///
/// Stores call this inside their commit lock or transaction. Any rule added,
/// removed or re-versioned since the snapshot is a [`Error::VersionConflict`],
/// which keeps concurrent inserts from sharing a group index.
pub fn verify_group_snapshot(delta: &GroupDelta, current: &[AlertRule]) -> Result<()> {
    let expected: BTreeMap<&str, i64> = delta
        .affected_groups
        .get(&delta.group_key)
        .map(|rules| rules.iter().map(|r| (r.uid.as_str(), r.version)).collect())
        .unwrap_or_default();
    let actual: BTreeMap<&str, i64> = current
        .iter()
        .filter(|r| r.group_key() == delta.group_key)
        .map(|r| (r.uid.as_str(), r.version))
        .collect();

    for (uid, version) in &actual {
        let expected_version = expected.get(uid).copied().unwrap_or(0);
        if expected_version != *version {
            return Err(Error::VersionConflict {
                uid: uid.to_string(),
                expected: expected_version,
                actual: *version,
            });
        }
    }
    if let Some((uid, version)) = expected.iter().find(|(uid, _)| !actual.contains_key(*uid)) {
        return Err(Error::VersionConflict {
            uid: uid.to_string(),
            expected: *version,
            actual: 0,
        });
    }
    Ok(())
}

/// Reject changes to provisioned rules coming from a different source
pub fn check_provenance(delta: &GroupDelta, requested: Provenance) -> Result<()> {
    let touched = delta
        .update
        .iter()
        .map(|u| &u.existing)
        .chain(delta.delete.iter());

    for rule in touched {
        if rule.provenance != Provenance::None && rule.provenance != requested {
            return Err(Error::ProvisionedRule {
                uid: rule.uid.clone(),
                provenance: rule.provenance.to_string(),
                requested: requested.to_string(),
            });
        }
    }
    Ok(())
}

/// Replace a group's rules with `submitted` and persist the result
///
/// Nothing is written when validation or the provenance check fails, and a
/// version conflict during commit aborts the whole group.
pub async fn update_rule_group(
    store: &dyn RuleStore,
    group_key: &AlertRuleGroupKey,
    submitted: Vec<AlertRule>,
    provenance: Provenance,
    base_interval_seconds: i64,
) -> Result<CommittedChanges> {
    let existing = store.list_rules(&RuleFilter::group(group_key)).await?;
    let submitted = submitted
        .into_iter()
        .map(|mut r| {
            r.provenance = provenance;
            r
        })
        .collect();

    let delta = calculate_changes(group_key, existing, submitted, base_interval_seconds)?;
    check_provenance(&delta, provenance)?;
    if delta.is_empty() {
        debug!(group = %group_key, "Rule group unchanged");
        return Ok(CommittedChanges::default());
    }

    let committed = store.commit_group_changes(&delta).await?;
    info!(
        group = %group_key,
        inserted = committed.inserted.len(),
        updated = committed.updated.len(),
        deleted = committed.deleted.len(),
        "Rule group updated"
    );
    Ok(committed)
}

/// Delete one rule, re-indexing its siblings
pub async fn delete_rule(
    store: &dyn RuleStore,
    key: &AlertRuleKey,
    provenance: Provenance,
    base_interval_seconds: i64,
) -> Result<CommittedChanges> {
    let rule = store
        .list_rules(&RuleFilter::uid(key.org_id, key.uid.clone()))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::RuleNotFound(key.uid.clone()))?;

    let group_key = rule.group_key();
    let existing = store.list_rules(&RuleFilter::group(&group_key)).await?;
    let remaining: Vec<AlertRule> = existing
        .iter()
        .filter(|r| r.uid != key.uid)
        .cloned()
        .collect();

    let delta = calculate_changes(&group_key, existing, remaining, base_interval_seconds)?;
    check_provenance(&delta, provenance)?;
    store.commit_group_changes(&delta).await
}

/// Delete every rule of a group
pub async fn delete_rule_group(
    store: &dyn RuleStore,
    group_key: &AlertRuleGroupKey,
    provenance: Provenance,
    base_interval_seconds: i64,
) -> Result<CommittedChanges> {
    let existing = store.list_rules(&RuleFilter::group(group_key)).await?;
    if existing.is_empty() {
        return Err(Error::RuleNotFound(group_key.to_string()));
    }
    let delta = calculate_changes(group_key, existing, Vec::new(), base_interval_seconds)?;
    check_provenance(&delta, provenance)?;
    store.commit_group_changes(&delta).await
}
