//! Rule scheduler
//!
//! A single ticker drives tick numbers at the base interval. Every active
//! rule owns one routine task fed through a one-slot channel: when a rule is
//! due and its routine is still busy, at most one tick waits and further
//! ticks are skipped and counted.
//!
//! ## Rule changes
//!
//! The routine registry is the only state behind a lock. Replacing a
//! routine cancels the old one and waits for it before the new one starts,
//! so a rule never has two evaluations in flight. Notifications are
//! delivered by tasks chained per rule, outside the routine, so a slow
//! forwarder never holds up a restart or the registry lock.
//!
//! ## Shutdown
//!
//! [`Scheduler::run`] returns [`Error::Cancelled`] once the shutdown token is
//! cancelled and every routine has exited.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use ruler_core::rule_group;
use ruler_core::{
    jitter_offset_in_ticks, AlertInstance, AlertRule, AlertRuleGroupKey, AlertRuleKey,
    CommittedChanges, ConditionEvaluator, Error, EvaluationPipeline, FinalizedAlert, Metrics,
    NotificationForwarder, Provenance, Result, RuleFilter, RuleStore, StateManager, StateReason,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;

#[derive(Debug, Clone, Copy)]
struct Tick {
    number: u64,
    eval_time: DateTime<Utc>,
}

/// What a routine needs to evaluate its rule, shared by all routines
#[derive(Clone)]
struct Evaluation {
    state: Arc<StateManager>,
    pipeline: EvaluationPipeline,
    forwarder: Arc<dyn NotificationForwarder>,
    metrics: Arc<Metrics>,
}

impl Evaluation {
    /// Evaluate one tick, returning the alerts due for delivery
    async fn evaluate(
        &self,
        rule: &AlertRule,
        tick: Tick,
        token: &CancellationToken,
    ) -> Vec<FinalizedAlert> {
        if rule.is_paused {
            debug!(rule_uid = %rule.uid, tick = tick.number, "Rule is paused, skipping evaluation");
            let transitions = self
                .state
                .reset_state_by_rule(rule, StateReason::Paused, tick.eval_time)
                .await;
            return self.state.take_sendable(rule, &transitions, tick.eval_time).await;
        }

        let org = rule.org_id.to_string();
        self.metrics.evaluations_total.with_label_values(&[&org]).inc();

        let results = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(rule_uid = %rule.uid, tick = tick.number, "Evaluation abandoned");
                return Vec::new();
            }
            results = self.pipeline.evaluate(rule, tick.eval_time) => results,
        };

        if results.iter().any(|r| r.is_rule_level_error()) {
            self.metrics
                .evaluation_failures_total
                .with_label_values(&[&org])
                .inc();
        }
        if let Some(first) = results.first() {
            self.metrics
                .evaluation_duration_seconds
                .with_label_values(&[&org])
                .observe(first.evaluation_duration.as_secs_f64());
        }

        let transitions = self
            .state
            .process_eval_results(rule, tick.eval_time, results)
            .await;
        debug!(
            rule_uid = %rule.uid,
            org_id = rule.org_id,
            tick = tick.number,
            instances = transitions.len(),
            "Rule evaluated"
        );

        self.state.take_sendable(rule, &transitions, tick.eval_time).await
    }

    /// Deliver `alerts` in a task of its own once `previous` has finished,
    /// so a rule's notifications go out in order without the routine
    /// waiting on the forwarder
    fn deliver_after(
        &self,
        previous: Option<JoinHandle<()>>,
        rule_uid: String,
        alerts: Vec<FinalizedAlert>,
    ) -> JoinHandle<()> {
        let evaluation = self.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                previous.await.ok();
            }
            evaluation.send(&rule_uid, alerts).await;
        })
    }

    async fn send(&self, rule_uid: &str, alerts: Vec<FinalizedAlert>) {
        if alerts.is_empty() {
            return;
        }
        let count = alerts.len() as u64;
        match self.forwarder.send(alerts).await {
            Ok(()) => self.metrics.notifications_sent_total.inc_by(count),
            Err(e) => warn!(rule_uid, count, error = %e, "Failed to forward alerts"),
        }
    }
}

/// Whole base intervals elapsed between `start` and `at`
pub(crate) fn tick_number(start: Instant, at: Instant, base: Duration) -> u64 {
    let base_ms = base.as_millis().max(1);
    u64::try_from(at.saturating_duration_since(start).as_millis() / base_ms).unwrap_or(u64::MAX)
}

/// A running rule routine and the handles to drive and stop it
struct RuleRoutine {
    rule: Arc<RwLock<Arc<AlertRule>>>,
    offset: i64,
    ticks_per_interval: i64,
    tx: mpsc::Sender<Tick>,
    token: CancellationToken,
    /// Resolves to the routine's last delivery, if one was started
    handle: JoinHandle<Option<JoinHandle<()>>>,
}

impl RuleRoutine {
    fn snapshot(&self) -> Arc<AlertRule> {
        self.rule.read().clone()
    }

    fn is_due(&self, tick: u64) -> bool {
        (tick as i64 + self.offset) % self.ticks_per_interval == 0
    }

    /// Cancel the routine and wait for it to exit
    ///
    /// Deliveries keep running; the handle of the last one is returned so
    /// later notifications for the rule can be ordered after it.
    async fn stop(self, metrics: &Metrics) -> Option<JoinHandle<()>> {
        let rule = self.snapshot();
        self.token.cancel();
        let delivery = match self.handle.await {
            Ok(delivery) => delivery,
            Err(e) => {
                if e.is_panic() {
                    error!(rule_uid = %rule.uid, "Rule routine panicked");
                }
                None
            }
        };
        metrics
            .schedulable_rules
            .with_label_values(&[&rule.org_id.to_string()])
            .dec();
        delivery
    }
}

/// Alert rule scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    rule_store: Arc<dyn RuleStore>,
    state: Arc<StateManager>,
    evaluation: Evaluation,
    metrics: Arc<Metrics>,
    routines: Mutex<HashMap<AlertRuleKey, RuleRoutine>>,
    root: CancellationToken,
    started_at: RwLock<DateTime<Utc>>,
    tick: AtomicU64,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        rule_store: Arc<dyn RuleStore>,
        state: Arc<StateManager>,
        evaluator: Arc<dyn ConditionEvaluator>,
        forwarder: Arc<dyn NotificationForwarder>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let evaluation = Evaluation {
            state: Arc::clone(&state),
            pipeline: EvaluationPipeline::new(evaluator, config.evaluation_timeout),
            forwarder,
            metrics: Arc::clone(&metrics),
        };
        Self {
            config,
            rule_store,
            state,
            evaluation,
            metrics,
            routines: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
            started_at: RwLock::new(Utc::now()),
            tick: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Loading the rule set is the only failure that prevents startup. On
    /// shutdown every routine is cancelled and joined before this returns
    /// [`Error::Cancelled`].
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let rules = self
            .rule_store
            .list_rules(&RuleFilter::all())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load alert rules");
                e
            })?;

        self.state.warm(&rules).await;
        *self.started_at.write() = Utc::now();
        let start = Instant::now();
        self.tick.store(0, Ordering::SeqCst);

        info!(
            base_interval_secs = self.config.base_interval.as_secs(),
            jitter = self.config.jitter.as_str(),
            rules = rules.len(),
            "Starting rule scheduler"
        );
        self.sync_rules(rules).await;

        let mut ticker = tokio::time::interval_at(start, self.config.base_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_resync: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Numbered from elapsed time, so skipped ticks still count and
            // eval times stay on the wall clock
            let tick = tick_number(start, Instant::now(), self.config.base_interval);
            self.tick.store(tick, Ordering::SeqCst);
            let resync = self.config.resync_interval_ticks;
            if resync > 0 && tick - last_resync >= resync {
                last_resync = tick;
                self.resync().await;
            }
            self.dispatch(tick).await;
        }

        info!("Stopping rule scheduler");
        self.stop_all().await;
        Err(Error::Cancelled)
    }

    /// Replace the rules of a group and restart the affected routines
    pub async fn update_rule_group(
        &self,
        group_key: &AlertRuleGroupKey,
        rules: Vec<AlertRule>,
        provenance: Provenance,
    ) -> Result<CommittedChanges> {
        let committed = rule_group::update_rule_group(
            self.rule_store.as_ref(),
            group_key,
            rules,
            provenance,
            self.config.base_interval_seconds(),
        )
        .await?;
        self.apply_changes(&committed).await;
        Ok(committed)
    }

    /// Delete one rule and stop its routine
    pub async fn delete_rule(
        &self,
        key: &AlertRuleKey,
        provenance: Provenance,
    ) -> Result<CommittedChanges> {
        let committed = rule_group::delete_rule(
            self.rule_store.as_ref(),
            key,
            provenance,
            self.config.base_interval_seconds(),
        )
        .await?;
        self.apply_changes(&committed).await;
        Ok(committed)
    }

    /// Delete every rule of a group and stop their routines
    pub async fn delete_rule_group(
        &self,
        group_key: &AlertRuleGroupKey,
        provenance: Provenance,
    ) -> Result<CommittedChanges> {
        let committed = rule_group::delete_rule_group(
            self.rule_store.as_ref(),
            group_key,
            provenance,
            self.config.base_interval_seconds(),
        )
        .await?;
        self.apply_changes(&committed).await;
        Ok(committed)
    }

    pub fn get_instances(&self, org_id: i64) -> Vec<AlertInstance> {
        self.state.get_instances(org_id)
    }

    pub fn get_instances_for_rule(&self, org_id: i64, rule_uid: &str) -> Vec<AlertInstance> {
        self.state.get_instances_for_rule(org_id, rule_uid)
    }

    /// Rules with a running routine, ordered by key
    pub async fn scheduled_rules(&self) -> Vec<Arc<AlertRule>> {
        let routines = self.routines.lock().await;
        let mut keys: Vec<&AlertRuleKey> = routines.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| routines.get(k).map(RuleRoutine::snapshot))
            .collect()
    }

    fn eval_time(&self, tick: u64) -> DateTime<Utc> {
        let elapsed_ms = self.config.base_interval.as_millis() as i64 * tick as i64;
        *self.started_at.read() + chrono::Duration::milliseconds(elapsed_ms)
    }

    fn logical_now(&self) -> DateTime<Utc> {
        self.eval_time(self.tick.load(Ordering::SeqCst))
    }

    async fn dispatch(&self, tick: u64) {
        let eval_time = self.eval_time(tick);
        let routines = self.routines.lock().await;

        for (key, routine) in routines.iter() {
            if !routine.is_due(tick) {
                continue;
            }
            match routine.tx.try_send(Tick {
                number: tick,
                eval_time,
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        rule_uid = %key.uid,
                        org_id = key.org_id,
                        tick,
                        "Rule is still evaluating, skipping tick"
                    );
                    self.metrics.record_missed(key.org_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(rule_uid = %key.uid, tick, "Rule routine has exited");
                }
            }
        }
    }

    async fn resync(&self) {
        match self.rule_store.list_rules(&RuleFilter::all()).await {
            Ok(rules) => {
                debug!(rules = rules.len(), "Resyncing rules from store");
                self.sync_rules(rules).await;
            }
            Err(e) => warn!(error = %e, "Failed to resync rules, keeping current set"),
        }
    }

    /// Reconcile the registry with a full rule set
    async fn sync_rules(&self, rules: Vec<AlertRule>) {
        let now = self.logical_now();
        let mut routines = self.routines.lock().await;

        let wanted: HashSet<AlertRuleKey> = rules.iter().map(|r| r.key()).collect();
        let removed: Vec<AlertRuleKey> = routines
            .keys()
            .filter(|k| !wanted.contains(*k))
            .cloned()
            .collect();
        for key in removed {
            if let Some(routine) = routines.remove(&key) {
                self.retire(routine, StateReason::RuleDeleted, now).await;
            }
        }

        for rule in rules {
            self.apply_rule(&mut routines, rule, now).await;
        }
    }

    async fn apply_changes(&self, committed: &CommittedChanges) {
        let now = self.logical_now();
        let mut routines = self.routines.lock().await;

        for rule in &committed.deleted {
            if let Some(routine) = routines.remove(&rule.key()) {
                self.retire(routine, StateReason::RuleDeleted, now).await;
            }
        }
        for update in &committed.updated {
            self.apply_rule(&mut routines, update.new.clone(), now).await;
        }
        for rule in &committed.inserted {
            self.apply_rule(&mut routines, rule.clone(), now).await;
        }
    }

    /// Start, replace or refresh the routine of one rule
    async fn apply_rule(
        &self,
        routines: &mut HashMap<AlertRuleKey, RuleRoutine>,
        rule: AlertRule,
        now: DateTime<Utc>,
    ) {
        let key = rule.key();
        let Some(mut routine) = routines.remove(&key) else {
            routines.insert(key, self.spawn_routine(rule));
            return;
        };

        let current = routine.snapshot();
        if current.version > rule.version {
            // Already running something newer
            routines.insert(key, routine);
            return;
        }

        if current.evaluation_changed(&rule) {
            let reason = if rule.is_paused {
                StateReason::Paused
            } else {
                StateReason::Updated
            };
            info!(
                rule_uid = %rule.uid,
                org_id = rule.org_id,
                version = rule.version,
                reason = %reason,
                "Restarting rule routine"
            );
            self.retire(routine, reason, now).await;
            routines.insert(key, self.spawn_routine(rule));
            return;
        }

        let base = self.config.base_interval_seconds();
        routine.offset = jitter_offset_in_ticks(&rule, base, self.config.jitter);
        *routine.rule.write() = Arc::new(rule);
        routines.insert(key, routine);
    }

    /// Stop a routine and reset its rule's instances, forwarding resolutions
    async fn retire(&self, routine: RuleRoutine, reason: StateReason, now: DateTime<Utc>) {
        let rule = routine.snapshot();
        let delivery = routine.stop(&self.metrics).await;

        let transitions = self.state.reset_state_by_rule(&rule, reason, now).await;
        let alerts = self.state.take_sendable(&rule, &transitions, now).await;
        if !alerts.is_empty() {
            self.evaluation.deliver_after(delivery, rule.uid.clone(), alerts);
        }
    }

    fn spawn_routine(&self, rule: AlertRule) -> RuleRoutine {
        let base = self.config.base_interval_seconds();
        let offset = jitter_offset_in_ticks(&rule, base, self.config.jitter);
        let ticks_per_interval = rule.ticks_per_interval(base);
        let org = rule.org_id.to_string();

        debug!(
            rule_uid = %rule.uid,
            org_id = rule.org_id,
            interval_secs = rule.interval_seconds,
            offset,
            "Starting rule routine"
        );

        let (tx, mut rx) = mpsc::channel::<Tick>(1);
        let token = self.root.child_token();
        let shared = Arc::new(RwLock::new(Arc::new(rule)));

        let evaluation = self.evaluation.clone();
        let task_rule = Arc::clone(&shared);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut delivery: Option<JoinHandle<()>> = None;
            loop {
                let tick = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    tick = rx.recv() => match tick {
                        Some(tick) => tick,
                        None => break,
                    },
                };
                let rule = task_rule.read().clone();
                let alerts = evaluation.evaluate(&rule, tick, &task_token).await;
                if !alerts.is_empty() {
                    let previous = delivery.take();
                    delivery = Some(evaluation.deliver_after(previous, rule.uid.clone(), alerts));
                }
            }
            delivery
        });

        self.metrics.schedulable_rules.with_label_values(&[&org]).inc();

        RuleRoutine {
            rule: shared,
            offset,
            ticks_per_interval,
            tx,
            token,
            handle,
        }
    }

    async fn stop_all(&self) {
        self.root.cancel();
        let routines: Vec<RuleRoutine> = {
            let mut routines = self.routines.lock().await;
            routines.drain().map(|(_, routine)| routine).collect()
        };
        let count = routines.len();
        let deliveries = join_all(routines.into_iter().map(|r| r.stop(&self.metrics))).await;
        join_all(deliveries.into_iter().flatten()).await;
        info!(routines = count, "All rule routines stopped");
    }
}
