//! Prometheus metrics for rule evaluation and alert state
//!
//! A [`Metrics`] value owns its registry and is handed to the scheduler and
//! the state manager at construction time.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    // Scheduler metrics
    pub evaluations_total: IntCounterVec,
    pub evaluation_failures_total: IntCounterVec,
    pub evaluation_duration_seconds: HistogramVec,
    pub evaluations_missed_total: IntCounterVec,
    pub schedulable_rules: GaugeVec,

    // State metrics
    pub state_transitions_total: CounterVec,
    pub stale_instances_evicted_total: IntCounter,
    pub notifications_sent_total: IntCounter,
    pub persistence_failures_total: IntCounterVec,
}

impl Metrics {
    /// Create a metrics sink with a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let evaluations_total = IntCounterVec::new(
            Opts::new("ruler_rule_evaluations_total", "Total rule evaluations"),
            &["org"],
        )?;

        let evaluation_failures_total = IntCounterVec::new(
            Opts::new(
                "ruler_rule_evaluation_failures_total",
                "Rule evaluations that produced an error result",
            ),
            &["org"],
        )?;

        let evaluation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ruler_rule_evaluation_duration_seconds",
                "Rule evaluation duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["org"],
        )?;

        let evaluations_missed_total = IntCounterVec::new(
            Opts::new(
                "ruler_evaluations_missed_total",
                "Ticks skipped because the rule was still evaluating",
            ),
            &["org"],
        )?;

        let schedulable_rules = GaugeVec::new(
            Opts::new("ruler_schedulable_rules", "Rules with a running ticker"),
            &["org"],
        )?;

        let state_transitions_total = CounterVec::new(
            Opts::new(
                "ruler_state_transitions_total",
                "Alert instance state changes by target state",
            ),
            &["to"],
        )?;

        let stale_instances_evicted_total = IntCounter::new(
            "ruler_stale_instances_evicted_total",
            "Alert instances evicted after their series disappeared",
        )?;

        let notifications_sent_total = IntCounter::new(
            "ruler_notifications_sent_total",
            "Alerts handed to the notification forwarder",
        )?;

        let persistence_failures_total = IntCounterVec::new(
            Opts::new(
                "ruler_persistence_failures_total",
                "Failed writes to the instance store or annotation sink",
            ),
            &["op"],
        )?;

        registry.register(Box::new(evaluations_total.clone()))?;
        registry.register(Box::new(evaluation_failures_total.clone()))?;
        registry.register(Box::new(evaluation_duration_seconds.clone()))?;
        registry.register(Box::new(evaluations_missed_total.clone()))?;
        registry.register(Box::new(schedulable_rules.clone()))?;
        registry.register(Box::new(state_transitions_total.clone()))?;
        registry.register(Box::new(stale_instances_evicted_total.clone()))?;
        registry.register(Box::new(notifications_sent_total.clone()))?;
        registry.register(Box::new(persistence_failures_total.clone()))?;

        Ok(Self {
            registry,
            evaluations_total,
            evaluation_failures_total,
            evaluation_duration_seconds,
            evaluations_missed_total,
            schedulable_rules,
            state_transitions_total,
            stale_instances_evicted_total,
            notifications_sent_total,
            persistence_failures_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    pub fn record_missed(&self, org_id: i64) {
        self.evaluations_missed_total
            .with_label_values(&[&org_id.to_string()])
            .inc();
    }

    pub fn record_persistence_failure(&self, op: &str) {
        self.persistence_failures_total.with_label_values(&[op]).inc();
    }
}
