//! State reconciliation
//!
//! [`StateManager`] turns the results of one rule evaluation into alert
//! instance transitions, keeps the [`StateCache`] and the persistent
//! [`InstanceStore`] in step, and decides which instances are due for
//! notification.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    AlertInstance, AlertState, EvaluationSample, InstanceKey, StateCache, StateReason,
    StateTransition, Status,
};
use crate::annotations::{AnnotationEntry, AnnotationSink};
use crate::eval::{EvalResult, EvalState};
use crate::labels::Labels;
use crate::metrics::Metrics;
use crate::notify::{needs_sending, FinalizedAlert};
use crate::rule::{AlertRule, AlertRuleKey, ExecErrState, NoDataState};
use crate::store::InstanceStore;

/// State manager configuration
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Minimum time between two notifications of an unchanged firing instance
    pub resend_delay: Duration,
    /// Evaluations kept in each instance's rolling window
    pub max_results_window: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            resend_delay: Duration::from_secs(30),
            max_results_window: 10,
        }
    }
}

/// Owns the alert instances of every rule
///
/// Each evaluation result goes through [`StateManager::process_eval_results`],
/// which applies the no-data and error policies, updates the cache, writes
/// changed instances to the [`InstanceStore`] and records transitions as
/// annotations. [`StateManager::warm`] reloads the cache on startup.
pub struct StateManager {
    cache: StateCache,
    instance_store: Arc<dyn InstanceStore>,
    annotations: Arc<dyn AnnotationSink>,
    metrics: Arc<Metrics>,
    config: StateConfig,
}

impl StateManager {
    pub fn new(
        instance_store: Arc<dyn InstanceStore>,
        annotations: Arc<dyn AnnotationSink>,
        metrics: Arc<Metrics>,
        config: StateConfig,
    ) -> Self {
        Self {
            cache: StateCache::new(),
            instance_store,
            annotations,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Rebuild the cache from the instance store for the given rule set
    ///
    /// Instances of rules that no longer exist are skipped. Failing to read
    /// the instance store is not fatal: evaluation rebuilds the state.
    pub async fn warm(&self, rules: &[AlertRule]) -> usize {
        let known: HashSet<AlertRuleKey> = rules.iter().map(|r| r.key()).collect();
        let mut orgs: Vec<i64> = rules.iter().map(|r| r.org_id).collect();
        orgs.sort_unstable();
        orgs.dedup();

        let mut loaded = 0;
        for org_id in orgs {
            let instances = match self.instance_store.list_instances(org_id).await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(org_id, error = %e, "Failed to load alert instances, starting empty");
                    self.metrics.record_persistence_failure("list_instances");
                    continue;
                }
            };

            for instance in instances {
                let key = AlertRuleKey::new(instance.org_id, instance.rule_uid.clone());
                if !known.contains(&key) {
                    warn!(
                        org_id,
                        rule_uid = %instance.rule_uid,
                        fingerprint = %instance.fingerprint,
                        "Dropping alert instance of unknown rule"
                    );
                    continue;
                }
                self.cache.set(instance);
                loaded += 1;
            }
        }

        info!(instances = loaded, "State cache warmed");
        loaded
    }

    /// Reconcile one evaluation of `rule` into instance transitions
    ///
    /// Transitions are returned for every instance touched by the results, in
    /// result order, followed by the resolved transitions of evicted stale
    /// instances.
    pub async fn process_eval_results(
        &self,
        rule: &AlertRule,
        eval_time: DateTime<Utc>,
        results: Vec<EvalResult>,
    ) -> Vec<StateTransition> {
        let key = rule.key();
        let rule_error = results.len() == 1 && results[0].is_rule_level_error();

        let work: Vec<(AlertInstance, &EvalResult)> = if rule_error {
            let existing = self.cache.get_for_rule(&key);
            if existing.is_empty() {
                vec![(
                    self.cache.get_or_create(&key, &Labels::new(), eval_time),
                    &results[0],
                )]
            } else {
                existing.into_iter().map(|i| (i, &results[0])).collect()
            }
        } else {
            results
                .iter()
                .map(|r| (self.cache.get_or_create(&key, &r.labels, eval_time), r))
                .collect()
        };

        let mut seen = HashSet::new();
        let mut transitions = Vec::with_capacity(work.len());
        for (mut instance, result) in work {
            instance.push_result(
                EvaluationSample {
                    evaluated_at: eval_time,
                    state: result.state,
                    values: result.values.clone(),
                },
                self.config.max_results_window,
            );
            instance.last_evaluation_time = eval_time;
            instance.evaluation_duration = result.evaluation_duration;
            instance.last_evaluation_string = result.evaluation_string.clone();
            instance.values = result.values.clone();
            instance.error = result.error.clone();

            let previous_state = instance.state();
            let previous_reason = instance.reason();
            self.apply_result(rule, &mut instance, result.state, eval_time);

            debug!(
                rule_uid = %rule.uid,
                fingerprint = %instance.fingerprint,
                from = %previous_state,
                to = %instance.state(),
                reason = %instance.reason(),
                "Processed evaluation result"
            );

            seen.insert(instance.fingerprint);
            self.cache.set(instance.clone());
            transitions.push(StateTransition {
                instance,
                previous_state,
                previous_reason,
            });
        }

        let mut evicted = Vec::new();
        if !rule_error {
            let threshold = clamped_seconds(rule.interval_seconds.saturating_mul(2));
            for mut instance in self.cache.sweep_stale(&key, &seen, eval_time, threshold) {
                evicted.push(instance.key());
                self.metrics.stale_instances_evicted_total.inc();
                if !instance.state().is_firing() {
                    debug!(rule_uid = %rule.uid, fingerprint = %instance.fingerprint, "Evicted stale instance");
                    continue;
                }
                info!(
                    rule_uid = %rule.uid,
                    fingerprint = %instance.fingerprint,
                    "Resolving stale firing instance"
                );
                let previous_state = instance.state();
                let previous_reason = instance.reason();
                resolve(&mut instance, StateReason::MissingSeries, eval_time);
                transitions.push(StateTransition {
                    instance,
                    previous_state,
                    previous_reason,
                });
            }
        }

        let current: Vec<AlertInstance> = transitions
            .iter()
            .filter(|t| !evicted.contains(&t.instance.key()))
            .map(|t| t.instance.clone())
            .collect();
        self.persist(&current, &evicted).await;
        self.record_transitions(rule, &transitions);
        transitions
    }

    /// Move every instance of a rule to Normal with `reason`
    ///
    /// `Paused` keeps the instances in the cache; `RuleDeleted` and `Updated`
    /// remove them. Firing instances come back resolved so their resolution
    /// can be forwarded.
    pub async fn reset_state_by_rule(
        &self,
        rule: &AlertRule,
        reason: StateReason,
        now: DateTime<Utc>,
    ) -> Vec<StateTransition> {
        let key = rule.key();
        let keep = reason == StateReason::Paused;
        let instances = if keep {
            self.cache.get_for_rule(&key)
        } else {
            self.cache.remove_rule(&key)
        };

        let mut transitions = Vec::new();
        for mut instance in instances {
            if instance.state() == AlertState::Normal && instance.reason() == reason {
                continue;
            }
            let previous_state = instance.state();
            let previous_reason = instance.reason();
            resolve(&mut instance, reason, now);
            if keep {
                self.cache.set(instance.clone());
            }
            transitions.push(StateTransition {
                instance,
                previous_state,
                previous_reason,
            });
        }

        if !transitions.is_empty() {
            info!(
                rule_uid = %rule.uid,
                org_id = rule.org_id,
                reason = %reason,
                instances = transitions.len(),
                "Reset rule state"
            );
        }

        let instances: Vec<AlertInstance> =
            transitions.iter().map(|t| t.instance.clone()).collect();
        if keep {
            self.persist(&instances, &[]).await;
        } else {
            let keys: Vec<InstanceKey> = instances.iter().map(|i| i.key()).collect();
            self.persist(&[], &keys).await;
        }
        self.record_transitions(rule, &transitions);
        transitions
    }

    /// Alerts due for delivery among `transitions`, marking them as sent
    ///
    /// The marks are written through to the instance store, so a restart
    /// neither repeats a resolved notification nor resends a firing one
    /// before the resend delay.
    pub async fn take_sendable(
        &self,
        rule: &AlertRule,
        transitions: &[StateTransition],
        now: DateTime<Utc>,
    ) -> Vec<FinalizedAlert> {
        let key = rule.key();
        let mut alerts = Vec::new();
        let mut marked = Vec::new();
        for transition in transitions {
            let instance = &transition.instance;
            if !needs_sending(instance, transition.changed(), self.config.resend_delay, now) {
                continue;
            }
            alerts.push(FinalizedAlert::from_instance(rule, instance));
            let updated = self.cache.update(&key, instance.fingerprint, |i| {
                i.last_sent_at = Some(now);
                i.resolved = false;
            });
            marked.extend(updated);
        }
        if !marked.is_empty() {
            self.persist(&marked, &[]).await;
        }
        alerts
    }

    /// Snapshot of an organization's instances, ordered by rule then labels
    pub fn get_instances(&self, org_id: i64) -> Vec<AlertInstance> {
        self.cache.get_all(org_id)
    }

    pub fn get_instances_for_rule(&self, org_id: i64, rule_uid: &str) -> Vec<AlertInstance> {
        self.cache.get_for_rule(&AlertRuleKey::new(org_id, rule_uid))
    }

    fn apply_result(
        &self,
        rule: &AlertRule,
        instance: &mut AlertInstance,
        state: EvalState,
        now: DateTime<Utc>,
    ) {
        instance.resolved = false;
        let reason = StateReason::Evaluated(state);

        match state {
            EvalState::Alerting => fire(rule, instance, reason, now),
            EvalState::Normal => resolve(instance, reason, now),
            EvalState::NoData => match rule.no_data_state {
                NoDataState::Alerting => fire(rule, instance, reason, now),
                NoDataState::NoData => hold(instance, AlertState::NoData, reason, now),
                NoDataState::Ok => resolve(instance, reason, now),
                NoDataState::KeepLast => keep_last(instance, state),
            },
            EvalState::Error => match rule.exec_err_state {
                ExecErrState::Alerting => fire(rule, instance, reason, now),
                ExecErrState::Error => hold(instance, AlertState::Error, reason, now),
                ExecErrState::Ok => resolve(instance, reason, now),
                ExecErrState::KeepLast => keep_last(instance, state),
            },
            // Not an external reason, the previous one stays
            EvalState::Pending => {}
        }

        if instance.state() != AlertState::Normal {
            instance.ends_at = now + self.ends_at_offset(rule);
        }
    }

    fn ends_at_offset(&self, rule: &AlertRule) -> chrono::Duration {
        let resend = i64::try_from(self.config.resend_delay.as_secs()).unwrap_or(i64::MAX);
        clamped_seconds(rule.interval_seconds.max(resend).saturating_mul(4))
    }

    async fn persist(&self, upsert: &[AlertInstance], delete: &[InstanceKey]) {
        if !upsert.is_empty() {
            if let Err(e) = self.instance_store.upsert_instances(upsert).await {
                warn!(error = %e, count = upsert.len(), "Failed to save alert instances");
                self.metrics.record_persistence_failure("upsert_instances");
            }
        }
        if !delete.is_empty() {
            if let Err(e) = self.instance_store.delete_instances(delete).await {
                warn!(error = %e, count = delete.len(), "Failed to delete alert instances");
                self.metrics.record_persistence_failure("delete_instances");
            }
        }
    }

    fn record_transitions(&self, rule: &AlertRule, transitions: &[StateTransition]) {
        for transition in transitions.iter().filter(|t| t.changed()) {
            self.metrics
                .state_transitions_total
                .with_label_values(&[transition.instance.state().as_str()])
                .inc();

            let entry = AnnotationEntry::from_transition(rule, transition);
            let sink = Arc::clone(&self.annotations);
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let rule_uid = entry.rule_uid.clone();
                if let Err(e) = sink.save(entry).await {
                    warn!(rule_uid = %rule_uid, error = %e, "Failed to save state annotation");
                    metrics.record_persistence_failure("save_annotation");
                }
            });
        }
    }
}

/// Offsets past this are clamped so timestamp arithmetic cannot overflow
const MAX_OFFSET_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

fn clamped_seconds(seconds: i64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.clamp(0, MAX_OFFSET_SECONDS))
}

/// Condition holds: go through Pending unless the for-duration is zero
fn fire(rule: &AlertRule, instance: &mut AlertInstance, reason: StateReason, now: DateTime<Utc>) {
    match instance.state() {
        AlertState::Alerting => {
            instance.status = Status::transition(AlertState::Alerting, reason);
        }
        AlertState::Pending => {
            if now - instance.starts_at >= clamped_seconds(rule.for_seconds) {
                instance.status = Status::transition(AlertState::Alerting, reason);
                instance.starts_at = now;
            } else {
                instance.status = Status::transition(AlertState::Pending, reason);
            }
        }
        _ => {
            let next = if rule.for_seconds == 0 {
                AlertState::Alerting
            } else {
                AlertState::Pending
            };
            instance.status = Status::transition(next, reason);
            instance.starts_at = now;
        }
    }
}

/// Enter Normal, resolving the instance if it was firing
fn resolve(instance: &mut AlertInstance, reason: StateReason, now: DateTime<Utc>) {
    let previous = instance.state();
    instance.status = Status::transition(AlertState::Normal, reason);
    if previous == AlertState::Normal {
        return;
    }
    instance.ends_at = now;
    if previous.is_firing() {
        instance.resolved = true;
        instance.resolved_at = Some(now);
    }
}

fn hold(instance: &mut AlertInstance, state: AlertState, reason: StateReason, now: DateTime<Utc>) {
    if instance.state() != state {
        instance.starts_at = now;
    }
    instance.status = Status::transition(state, reason);
}

fn keep_last(instance: &mut AlertInstance, state: EvalState) {
    instance.status = Status::transition(instance.state(), StateReason::KeepLast(state));
}
