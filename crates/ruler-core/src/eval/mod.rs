//! Evaluation pipeline
//!
//! Thin adapter over an external [`ConditionEvaluator`]. It guarantees that
//! a rule evaluation always yields a well-formed, deterministically ordered
//! [`Results`] set: evaluator failures, timeouts and panics become a single
//! synthetic `Error` result, and an empty answer becomes a synthetic `NoData`
//! result.

pub mod snapshot;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::labels::Labels;
use crate::rule::AlertRule;

pub use snapshot::SnapshotEvaluator;

/// State reported by the evaluator for one series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvalState {
    Normal,
    Alerting,
    /// Internal synthetic state, evaluators should never report it
    Pending,
    NoData,
    Error,
}

impl EvalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Alerting => "Alerting",
            Self::Pending => "Pending",
            Self::NoData => "NoData",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for EvalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation outcome for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub labels: Labels,
    pub state: EvalState,
    pub error: Option<String>,
    pub values: BTreeMap<String, f64>,
    pub evaluated_at: DateTime<Utc>,
    pub evaluation_duration: Duration,
    pub evaluation_string: String,
}

impl EvalResult {
    pub fn new(labels: Labels, state: EvalState, evaluated_at: DateTime<Utc>) -> Self {
        Self {
            labels,
            state,
            error: None,
            values: BTreeMap::new(),
            evaluated_at,
            evaluation_duration: Duration::ZERO,
            evaluation_string: String::new(),
        }
    }

    /// Synthetic result for a rule whose queries returned nothing
    pub fn no_data(evaluated_at: DateTime<Utc>) -> Self {
        Self::new(Labels::new(), EvalState::NoData, evaluated_at)
    }

    /// Synthetic result for a rule whose evaluation failed as a whole
    pub fn error(evaluated_at: DateTime<Utc>, error: &EvaluationError) -> Self {
        let mut result = Self::new(Labels::new(), EvalState::Error, evaluated_at);
        result.error = Some(error.to_string());
        result.evaluation_string = error.to_string();
        result
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_evaluation_string(mut self, s: impl Into<String>) -> Self {
        self.evaluation_string = s.into();
        self
    }

    /// True for the single synthetic result produced when evaluation failed
    pub fn is_rule_level_error(&self) -> bool {
        self.state == EvalState::Error && self.labels.is_empty()
    }
}

/// All series results of one rule evaluation, in label order
pub type Results = Vec<EvalResult>;

/// Evaluator-level failure kinds. These never leave the pipeline: they are
/// turned into a synthetic `Error` result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("evaluator panicked: {0}")]
    Panicked(String),

    #[error("evaluation was cancelled")]
    Cancelled,
}

/// External query/condition evaluator
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        rule: &AlertRule,
        eval_time: DateTime<Utc>,
    ) -> std::result::Result<Results, EvaluationError>;
}

/// Aborts the evaluator task if the pipeline future is dropped mid-flight.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct EvaluationPipeline {
    evaluator: Arc<dyn ConditionEvaluator>,
    timeout: Duration,
}

impl EvaluationPipeline {
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>, timeout: Duration) -> Self {
        Self { evaluator, timeout }
    }

    /// Evaluate one rule at `eval_time`. Never fails; see module docs.
    pub async fn evaluate(&self, rule: &AlertRule, eval_time: DateTime<Utc>) -> Results {
        let started = Instant::now();
        let evaluator = Arc::clone(&self.evaluator);
        let task_rule = rule.clone();
        let handle =
            tokio::spawn(async move { evaluator.evaluate(&task_rule, eval_time).await });
        let _guard = AbortOnDrop(handle.abort_handle());

        let outcome = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(EvaluationError::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(_)) => Err(EvaluationError::Cancelled),
            Err(_) => Err(EvaluationError::Timeout(self.timeout)),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(results) if results.is_empty() => {
                debug!(rule_uid = %rule.uid, "Evaluation returned no series");
                let mut result = EvalResult::no_data(eval_time);
                result.evaluation_duration = elapsed;
                vec![result]
            }
            Ok(results) => normalize(results, eval_time, elapsed),
            Err(e) => {
                warn!(rule_uid = %rule.uid, org_id = rule.org_id, error = %e, "Rule evaluation failed");
                let mut result = EvalResult::error(eval_time, &e);
                result.evaluation_duration = elapsed;
                vec![result]
            }
        }
    }
}

fn normalize(mut results: Results, eval_time: DateTime<Utc>, elapsed: Duration) -> Results {
    results.sort_by(|a, b| a.labels.cmp(&b.labels));
    let before = results.len();
    results.dedup_by(|b, a| a.labels == b.labels);
    if results.len() != before {
        warn!(
            dropped = before - results.len(),
            "Evaluator returned duplicate series, keeping the first of each"
        );
    }
    for result in &mut results {
        result.evaluated_at = eval_time;
        if result.evaluation_duration.is_zero() {
            result.evaluation_duration = elapsed;
        }
    }
    results
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::AlertRuleGroupKey;

    struct FixedEvaluator(std::result::Result<Results, EvaluationError>);

    #[async_trait]
    impl ConditionEvaluator for FixedEvaluator {
        async fn evaluate(
            &self,
            _rule: &AlertRule,
            _eval_time: DateTime<Utc>,
        ) -> std::result::Result<Results, EvaluationError> {
            self.0.clone()
        }
    }

    struct PanickingEvaluator;

    #[async_trait]
    impl ConditionEvaluator for PanickingEvaluator {
        async fn evaluate(
            &self,
            _rule: &AlertRule,
            _eval_time: DateTime<Utc>,
        ) -> std::result::Result<Results, EvaluationError> {
            panic!("datasource plugin crashed");
        }
    }

    struct SlowEvaluator;

    #[async_trait]
    impl ConditionEvaluator for SlowEvaluator {
        async fn evaluate(
            &self,
            _rule: &AlertRule,
            _eval_time: DateTime<Utc>,
        ) -> std::result::Result<Results, EvaluationError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn rule() -> AlertRule {
        AlertRule::new(&AlertRuleGroupKey::new(1, "ns", "g"), "r", "x > 1").with_uid("r1")
    }

    fn labels(value: &str) -> Labels {
        let mut l = Labels::new();
        l.insert("instance".to_string(), value.to_string());
        l
    }

    fn pipeline(evaluator: impl ConditionEvaluator + 'static) -> EvaluationPipeline {
        EvaluationPipeline::new(Arc::new(evaluator), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_results_are_sorted_by_labels() {
        let now = Utc::now();
        let evaluator = FixedEvaluator(Ok(vec![
            EvalResult::new(labels("c"), EvalState::Normal, now),
            EvalResult::new(labels("a"), EvalState::Alerting, now),
            EvalResult::new(labels("b"), EvalState::Normal, now),
        ]));

        let results = pipeline(evaluator).evaluate(&rule(), now).await;
        let order: Vec<_> = results.iter().map(|r| r.labels["instance"].clone()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(results.iter().all(|r| r.evaluated_at == now));
    }

    #[tokio::test]
    async fn test_empty_results_become_no_data() {
        let now = Utc::now();
        let results = pipeline(FixedEvaluator(Ok(Vec::new()))).evaluate(&rule(), now).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].state, EvalState::NoData);
        assert!(results[0].labels.is_empty());
    }

    #[tokio::test]
    async fn test_query_error_becomes_error_result() {
        let now = Utc::now();
        let evaluator = FixedEvaluator(Err(EvaluationError::Query("connection refused".into())));
        let results = pipeline(evaluator).evaluate(&rule(), now).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_rule_level_error());
        assert!(results[0].evaluation_string.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let results = pipeline(PanickingEvaluator).evaluate(&rule(), Utc::now()).await;
        assert_eq!(results[0].state, EvalState::Error);
        assert!(results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("datasource plugin crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error() {
        let pipeline = EvaluationPipeline::new(Arc::new(SlowEvaluator), Duration::from_secs(5));
        let results = pipeline.evaluate(&rule(), Utc::now()).await;
        assert_eq!(results[0].state, EvalState::Error);
        assert!(results[0].evaluation_string.contains("timed out"));
    }

    #[tokio::test]
    async fn test_duplicate_series_are_dropped() {
        let now = Utc::now();
        let evaluator = FixedEvaluator(Ok(vec![
            EvalResult::new(labels("a"), EvalState::Alerting, now),
            EvalResult::new(labels("a"), EvalState::Normal, now),
        ]));
        let results = pipeline(evaluator).evaluate(&rule(), now).await;
        assert_eq!(results.len(), 1);
    }
}
