//! Database tests for rule and instance persistence

use chrono::Utc;

use crate::database::Database;
use crate::eval::EvalState;
use crate::labels::Labels;
use crate::rule::{AlertRule, AlertRuleGroupKey, AlertRuleKey, NoDataState, Provenance};
use crate::rule_group::{calculate_changes, update_rule_group};
use crate::state::{AlertInstance, AlertState, StateReason, Status};
use crate::store::{InstanceStore, RuleFilter, RuleStore, RuleUpdate};
use crate::Error;

fn group() -> AlertRuleGroupKey {
    AlertRuleGroupKey::new(1, "ns-1", "group-a")
}

fn rule(title: &str) -> AlertRule {
    AlertRule::new(&group(), title, "cpu > 90").with_interval(60)
}

#[tokio::test]
async fn test_insert_and_list_rules() {
    let db = Database::in_memory().await.unwrap();

    let mut annotated = rule("disk full")
        .with_label("severity", "page")
        .with_no_data_state(NoDataState::KeepLast)
        .with_for(300);
    annotated
        .annotations
        .insert("summary".to_string(), "Disk is full".to_string());
    annotated.rule_group_index = 1;

    let inserted = db
        .insert_rules(vec![rule("cpu high"), annotated])
        .await
        .unwrap();
    assert_eq!(inserted.len(), 2);
    assert!(inserted.iter().all(|r| r.id > 0 && r.version == 1 && !r.uid.is_empty()));

    let listed = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].title, "cpu high");
    assert_eq!(listed[1].title, "disk full");
    assert_eq!(listed[1].labels["severity"], "page");
    assert_eq!(listed[1].annotations["summary"], "Disk is full");
    assert_eq!(listed[1].no_data_state, NoDataState::KeepLast);
    assert_eq!(listed[1].for_seconds, 300);
    assert_eq!(listed[1].data, inserted[1].data);

    let by_uid = db
        .list_rules(&RuleFilter::uid(1, inserted[1].uid.clone()))
        .await
        .unwrap();
    assert_eq!(by_uid.len(), 1);
    assert!(db.list_rules(&RuleFilter::uid(2, inserted[1].uid.clone())).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_insert_duplicate_uid() {
    let db = Database::in_memory().await.unwrap();
    db.insert_rules(vec![rule("a").with_uid("same")]).await.unwrap();

    let err = db
        .insert_rules(vec![rule("b").with_uid("same")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateUid(uid) if uid == "same"));
}

#[tokio::test]
async fn test_update_with_stale_version_rolls_back() {
    let db = Database::in_memory().await.unwrap();
    let inserted = db.insert_rules(vec![rule("a"), rule("b")]).await.unwrap();

    let good = RuleUpdate {
        existing: inserted[0].clone(),
        new: inserted[0].clone().with_for(60),
    };
    let mut stale_existing = inserted[1].clone();
    stale_existing.version = 5;
    let stale = RuleUpdate {
        existing: stale_existing.clone(),
        new: stale_existing.with_for(60),
    };

    let err = db.update_rules(vec![good, stale]).await.unwrap_err();
    assert!(matches!(err, Error::VersionConflict { expected: 5, actual: 1, .. }));

    let listed = db.list_rules(&RuleFilter::all()).await.unwrap();
    assert!(listed.iter().all(|r| r.version == 1 && r.for_seconds == 0));
}

#[tokio::test]
async fn test_group_commit_is_atomic() {
    let db = Database::in_memory().await.unwrap();
    let submitted = vec![rule("a"), rule("b"), rule("c")];
    update_rule_group(&db, &group(), submitted, Provenance::None, 10)
        .await
        .unwrap();
    let existing = db.list_rules(&RuleFilter::group(&group())).await.unwrap();

    // Drop "b" and rename "c", computed from the current versions
    let mut renamed = existing[2].clone();
    renamed.title = "c2".to_string();
    let delta = calculate_changes(
        &group(),
        existing.clone(),
        vec![existing[0].clone(), renamed, rule("d")],
        10,
    )
    .unwrap();

    // Someone else bumps "b" in between
    db.update_rules(vec![RuleUpdate {
        existing: existing[1].clone(),
        new: existing[1].clone().with_for(30),
    }])
    .await
    .unwrap();

    let err = db.commit_group_changes(&delta).await.unwrap_err();
    assert!(err.is_conflict());

    let after = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
    let titles: Vec<&str> = after.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_group_commit_reindexes() {
    let db = Database::in_memory().await.unwrap();
    update_rule_group(
        &db,
        &group(),
        vec![rule("a"), rule("b"), rule("c")],
        Provenance::Api,
        10,
    )
    .await
    .unwrap();
    let existing = db.list_rules(&RuleFilter::group(&group())).await.unwrap();

    let committed = update_rule_group(
        &db,
        &group(),
        vec![existing[2].clone(), existing[0].clone()],
        Provenance::Api,
        10,
    )
    .await
    .unwrap();
    assert_eq!(committed.deleted.len(), 1);
    assert_eq!(committed.updated.len(), 2);

    let after = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
    let order: Vec<(&str, i32)> = after
        .iter()
        .map(|r| (r.title.as_str(), r.rule_group_index))
        .collect();
    assert_eq!(order, vec![("c", 0), ("a", 1)]);
    assert!(after.iter().all(|r| r.version == 2 && r.provenance == Provenance::Api));

    let err = update_rule_group(&db, &group(), Vec::new(), Provenance::None, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProvisionedRule { .. }));
}

#[tokio::test]
async fn test_inserts_from_same_snapshot_keep_indices_unique() {
    let db = Database::in_memory().await.unwrap();
    update_rule_group(&db, &group(), vec![rule("a")], Provenance::None, 10)
        .await
        .unwrap();
    let snapshot = db.list_rules(&RuleFilter::group(&group())).await.unwrap();

    let with_new = |title: &str| {
        let mut submitted = snapshot.clone();
        submitted.push(rule(title));
        calculate_changes(&group(), snapshot.clone(), submitted, 10).unwrap()
    };
    let first = with_new("b");
    let second = with_new("c");
    assert!(first.update.is_empty() && second.update.is_empty());

    db.commit_group_changes(&first).await.unwrap();
    let err = db.commit_group_changes(&second).await.unwrap_err();
    assert!(matches!(err, Error::VersionConflict { expected: 0, actual: 1, .. }));

    let after = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
    let order: Vec<(&str, i32)> = after
        .iter()
        .map(|r| (r.title.as_str(), r.rule_group_index))
        .collect();
    assert_eq!(order, vec![("a", 0), ("b", 1)]);
}

#[tokio::test]
async fn test_instance_roundtrip() {
    let db = Database::in_memory().await.unwrap();
    let now = Utc::now();

    let mut labels = Labels::new();
    labels.insert("host".to_string(), "web-1".to_string());
    let mut instance = AlertInstance::new(&AlertRuleKey::new(1, "rule-1"), labels, now);
    instance.status =
        Status::new(AlertState::Alerting, StateReason::KeepLast(EvalState::NoData)).unwrap();
    instance.ends_at = now + chrono::Duration::seconds(240);
    instance.error = Some("query failed".to_string());
    instance.last_sent_at = Some(now);
    instance.resolved = true;

    db.upsert_instances(&[instance.clone()]).await.unwrap();
    db.upsert_instances(&[instance.clone()]).await.unwrap();

    let loaded = db.list_instances(1).await.unwrap();
    assert_eq!(loaded.len(), 1);
    let loaded = &loaded[0];
    assert_eq!(loaded.fingerprint, instance.fingerprint);
    assert_eq!(loaded.labels, instance.labels);
    assert_eq!(loaded.status, instance.status);
    assert_eq!(loaded.error.as_deref(), Some("query failed"));
    assert_eq!(loaded.ends_at.timestamp(), instance.ends_at.timestamp());
    assert!(loaded.last_sent_at.is_some());
    assert!(loaded.resolved);

    instance.resolved = false;
    db.upsert_instances(&[instance.clone()]).await.unwrap();
    assert!(!db.list_instances(1).await.unwrap()[0].resolved);

    assert!(db.list_instances(2).await.unwrap().is_empty());

    db.delete_instances(&[instance.key()]).await.unwrap();
    assert!(db.list_instances(1).await.unwrap().is_empty());
}
