//! Integration tests for ruler
//!
//! These tests drive the scheduler, the state manager and the stores together

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ruler_core::{
    rule_group, AlertRule, AlertRuleGroupKey, AlertState, ConditionEvaluator, Database,
    EvalResult, EvalState, EvaluationError, FinalizedAlert, InstanceStore, Labels,
    LogAnnotationSink, MemoryInstanceStore, MemoryRuleStore, Metrics, NoDataState,
    NotificationForwarder, Provenance, Results, RuleFilter, RuleStore, StateConfig, StateManager,
    StateReason,
};
use ruler_scheduler::{Scheduler, SchedulerConfig};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ==================== Test Helpers ====================

/// Replays a per-rule script of states, then keeps answering Normal
#[derive(Default)]
struct ScriptedEvaluator {
    scripts: Mutex<HashMap<String, VecDeque<EvalState>>>,
}

impl ScriptedEvaluator {
    fn script(self, uid: &str, states: &[EvalState]) -> Self {
        self.scripts
            .lock()
            .insert(uid.to_string(), states.iter().copied().collect());
        self
    }
}

#[async_trait]
impl ConditionEvaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        rule: &AlertRule,
        eval_time: DateTime<Utc>,
    ) -> Result<Results, EvaluationError> {
        let state = self
            .scripts
            .lock()
            .get_mut(&rule.uid)
            .and_then(|s| s.pop_front())
            .unwrap_or(EvalState::Normal);

        if state == EvalState::NoData {
            return Ok(vec![EvalResult::no_data(eval_time)]);
        }
        let mut labels = Labels::new();
        labels.insert("host".to_string(), "web-1".to_string());
        Ok(vec![EvalResult::new(labels, state, eval_time).with_value("A", 95.0)])
    }
}

#[derive(Default)]
struct CollectingForwarder {
    sent: Mutex<Vec<FinalizedAlert>>,
}

impl CollectingForwarder {
    fn for_rule(&self, uid: &str) -> Vec<FinalizedAlert> {
        self.sent
            .lock()
            .iter()
            .filter(|a| a.labels.get("__alert_rule_uid__").map(String::as_str) == Some(uid))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationForwarder for CollectingForwarder {
    async fn send(&self, alerts: Vec<FinalizedAlert>) -> ruler_core::Result<()> {
        self.sent.lock().extend(alerts);
        Ok(())
    }
}

fn group() -> AlertRuleGroupKey {
    AlertRuleGroupKey::new(1, "infra", "hosts")
}

/// One-second ticks for scenarios that run against SQLite on the real clock.
/// The paused clock would auto-advance while sqlx waits on its worker thread.
fn real_time_config() -> SchedulerConfig {
    SchedulerConfig {
        base_interval: Duration::from_secs(1),
        ..Default::default()
    }
}

fn scheduler(
    config: SchedulerConfig,
    rule_store: Arc<dyn RuleStore>,
    instance_store: Arc<dyn InstanceStore>,
    evaluator: ScriptedEvaluator,
    forwarder: Arc<CollectingForwarder>,
) -> Arc<Scheduler> {
    let metrics = Arc::new(Metrics::new().unwrap());
    let state = Arc::new(StateManager::new(
        instance_store,
        Arc::new(LogAnnotationSink),
        metrics.clone(),
        StateConfig::default(),
    ));
    Arc::new(Scheduler::new(
        config,
        rule_store,
        state,
        Arc::new(evaluator),
        forwarder,
        metrics,
    ))
}

async fn run_for(scheduler: &Arc<Scheduler>, duration: Duration) {
    let shutdown = CancellationToken::new();
    let runner = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    tokio::time::sleep(duration).await;
    shutdown.cancel();
    let result = runner.await.unwrap();
    assert!(matches!(result, Err(ruler_core::Error::Cancelled)));
}

// ==================== Scheduling Scenarios ====================

mod scheduling {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_alert_fires_and_resolves() {
        let store = Arc::new(MemoryRuleStore::new());
        store
            .insert_rules(vec![AlertRule::new(&group(), "CPU high", "cpu > 90")
                .with_uid("cpu")
                .with_interval(10)])
            .await
            .unwrap();

        let forwarder = Arc::new(CollectingForwarder::default());
        let evaluator = ScriptedEvaluator::default().script(
            "cpu",
            &[EvalState::Alerting, EvalState::Alerting, EvalState::Normal],
        );
        let scheduler = scheduler(
            SchedulerConfig::default(),
            store,
            Arc::new(MemoryInstanceStore::new()),
            evaluator,
            forwarder.clone(),
        );

        run_for(&scheduler, Duration::from_secs(25)).await;

        // Fired on the first tick, held through the second, resolved on the third
        let alerts = forwarder.for_rule("cpu");
        assert_eq!(alerts.len(), 2);
        let fired = &alerts[0];
        let resolved = &alerts[1];

        assert_eq!(fired.labels.get("alertname").map(String::as_str), Some("CPU high"));
        assert_eq!(fired.labels.get("host").map(String::as_str), Some("web-1"));
        assert!(fired.ends_at > fired.starts_at);

        assert_eq!(resolved.starts_at, fired.starts_at);
        assert_eq!((resolved.ends_at - fired.starts_at).num_seconds(), 20);
        assert!(resolved.is_resolved(resolved.ends_at));

        let instances = scheduler.get_instances_for_rule(1, "cpu");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state(), AlertState::Normal);
        assert_eq!(instances[0].reason(), StateReason::Evaluated(EvalState::Normal));
    }

    #[tokio::test]
    async fn test_no_data_policies_persist_through_database() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.insert_rules(vec![
            AlertRule::new(&group(), "Exporter down", "up == 0")
                .with_uid("nd-alerting")
                .with_interval(10)
                .with_no_data_state(NoDataState::Alerting),
            AlertRule::new(&group(), "Queue depth", "queue > 100")
                .with_uid("nd-nodata")
                .with_interval(10),
        ])
        .await
        .unwrap();

        let forwarder = Arc::new(CollectingForwarder::default());
        let evaluator = ScriptedEvaluator::default()
            .script("nd-alerting", &[EvalState::NoData])
            .script("nd-nodata", &[EvalState::NoData]);
        let scheduler = scheduler(
            real_time_config(),
            db.clone(),
            db.clone(),
            evaluator,
            forwarder.clone(),
        );

        run_for(&scheduler, Duration::from_millis(500)).await;

        let mut stored = db.list_instances(1).await.unwrap();
        stored.sort_by(|a, b| a.rule_uid.cmp(&b.rule_uid));
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].rule_uid, "nd-alerting");
        assert_eq!(stored[0].state(), AlertState::Alerting);
        assert_eq!(stored[0].reason(), StateReason::Evaluated(EvalState::NoData));
        assert_eq!(stored[1].rule_uid, "nd-nodata");
        assert_eq!(stored[1].state(), AlertState::NoData);

        let no_data = forwarder.for_rule("nd-nodata");
        assert_eq!(
            no_data[0].labels.get("alertname").map(String::as_str),
            Some("DatasourceNoData")
        );
        let alerting = forwarder.for_rule("nd-alerting");
        assert_eq!(
            alerting[0].labels.get("alertname").map(String::as_str),
            Some("Exporter down")
        );
    }

    #[tokio::test]
    async fn test_restart_restores_firing_state() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.insert_rules(vec![AlertRule::new(&group(), "CPU high", "cpu > 90")
            .with_uid("cpu")
            .with_interval(10)])
            .await
            .unwrap();

        let first = Arc::new(CollectingForwarder::default());
        let scheduler_a = scheduler(
            real_time_config(),
            db.clone(),
            db.clone(),
            ScriptedEvaluator::default().script("cpu", &[EvalState::Alerting]),
            first.clone(),
        );
        run_for(&scheduler_a, Duration::from_millis(500)).await;
        let fired = first.for_rule("cpu");
        assert_eq!(fired.len(), 1);
        let stored = db.list_instances(1).await.unwrap();
        let first_sent = stored[0].last_sent_at.expect("send time is persisted");
        assert!(first_sent >= fired[0].starts_at);

        // A fresh scheduler warms its cache from the instance store, so the
        // next Normal result resolves the alert that fired before the restart
        let second = Arc::new(CollectingForwarder::default());
        let scheduler_b = scheduler(
            real_time_config(),
            db.clone(),
            db.clone(),
            ScriptedEvaluator::default().script("cpu", &[EvalState::Normal]),
            second.clone(),
        );
        run_for(&scheduler_b, Duration::from_millis(500)).await;

        let resolved = second.for_rule("cpu");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].starts_at, fired[0].starts_at);
        assert!(resolved[0].ends_at < fired[0].ends_at);

        let stored = db.list_instances(1).await.unwrap();
        assert!(!stored[0].resolved);
        assert!(stored[0].last_sent_at > Some(first_sent));
    }
}

// ==================== Rule Group Changes ====================

mod rule_groups {
    use super::*;

    async fn seeded_db() -> (Arc<Database>, AlertRule) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let committed = rule_group::update_rule_group(
            db.as_ref(),
            &group(),
            vec![AlertRule::new(&group(), "CPU high", "cpu > 90").with_interval(60)],
            Provenance::Api,
            10,
        )
        .await
        .unwrap();
        (db, committed.inserted[0].clone())
    }

    #[tokio::test]
    async fn test_concurrent_updates_from_same_version() {
        let (db, base) = seeded_db().await;
        assert_eq!(base.version, 1);

        let mut left = base.clone();
        left.title = "CPU high (left)".to_string();
        let mut right = base.clone();
        right.title = "CPU high (right)".to_string();

        let spawn_update = |rule: AlertRule| {
            let db = db.clone();
            tokio::spawn(async move {
                rule_group::update_rule_group(db.as_ref(), &group(), vec![rule], Provenance::Api, 10)
                    .await
            })
        };
        let (a, b) = tokio::join!(spawn_update(left), spawn_update(right));
        let results = [a.unwrap(), b.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_conflict()))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);

        let stored = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].version, 2);
        assert!(stored[0].title.ends_with("(left)") || stored[0].title.ends_with("(right)"));
    }

    #[tokio::test]
    async fn test_provisioned_rules_reject_other_sources() {
        let (db, base) = seeded_db().await;

        let mut edited = base.clone();
        edited.title = "edited from a file".to_string();
        let err = rule_group::update_rule_group(
            db.as_ref(),
            &group(),
            vec![edited],
            Provenance::File,
            10,
        )
        .await
        .unwrap_err();
        assert!(err.is_conflict());

        let stored = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
        assert_eq!(stored[0].title, "CPU high");
        assert_eq!(stored[0].version, 1);
    }

    #[tokio::test]
    async fn test_group_replace_reindexes_and_deletes() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let committed = rule_group::update_rule_group(
            db.as_ref(),
            &group(),
            vec![
                AlertRule::new(&group(), "a", "x > 1").with_uid("a").with_interval(20),
                AlertRule::new(&group(), "b", "x > 2").with_uid("b").with_interval(20),
                AlertRule::new(&group(), "c", "x > 3").with_uid("c").with_interval(20),
            ],
            Provenance::None,
            10,
        )
        .await
        .unwrap();
        let by_uid: HashMap<String, AlertRule> = committed
            .inserted
            .into_iter()
            .map(|r| (r.uid.clone(), r))
            .collect();

        // Drop `a` and swap the order of the others
        rule_group::update_rule_group(
            db.as_ref(),
            &group(),
            vec![by_uid["c"].clone(), by_uid["b"].clone()],
            Provenance::None,
            10,
        )
        .await
        .unwrap();

        let stored = db.list_rules(&RuleFilter::group(&group())).await.unwrap();
        let order: Vec<(&str, i32)> = stored
            .iter()
            .map(|r| (r.uid.as_str(), r.rule_group_index))
            .collect();
        assert_eq!(order, vec![("c", 0), ("b", 1)]);
    }
}
