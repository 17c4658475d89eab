//! File-backed condition evaluator
//!
//! Evaluates threshold expressions such as `cpu_usage > 90` against a JSON
//! file of current samples. Each sample whose metric name matches yields one
//! series result, labelled with the sample's labels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::{ConditionEvaluator, EvalResult, EvalState, EvaluationError, Results};
use crate::labels::Labels;
use crate::rule::AlertRule;

/// One metric sample in the snapshot file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub metric: String,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
}

/// Threshold comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOperator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl ThresholdOperator {
    /// Evaluate the operator against two values
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
            Self::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            ">" => Some(Self::GreaterThan),
            ">=" => Some(Self::GreaterOrEqual),
            "<" => Some(Self::LessThan),
            "<=" => Some(Self::LessOrEqual),
            "==" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            _ => None,
        }
    }
}

/// Parsed `metric <op> threshold` expression
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCondition {
    pub metric: String,
    pub operator: ThresholdOperator,
    pub threshold: f64,
}

impl ThresholdCondition {
    /// Parse a condition string
    ///
    /// Examples:
    /// - "cpu_usage > 90"
    /// - "queue_depth >= 100"
    pub fn parse(condition: &str) -> std::result::Result<Self, String> {
        let re = Regex::new(r"^([A-Za-z_:][A-Za-z0-9_:]*)\s*(>=|<=|==|!=|>|<)\s*(-?[0-9.]+)$")
            .map_err(|e| format!("Regex error: {}", e))?;

        let caps = re
            .captures(condition.trim())
            .ok_or_else(|| format!("Invalid threshold condition: {}", condition))?;

        let metric = caps[1].to_string();
        let operator = ThresholdOperator::parse(&caps[2])
            .ok_or_else(|| format!("Invalid operator: {}", &caps[2]))?;
        let threshold: f64 = caps[3]
            .parse()
            .map_err(|e| format!("Invalid threshold value: {}", e))?;

        Ok(Self {
            metric,
            operator,
            threshold,
        })
    }
}

/// Evaluator reading samples from a JSON file on every evaluation
pub struct SnapshotEvaluator {
    path: PathBuf,
}

impl SnapshotEvaluator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> std::result::Result<Vec<Sample>, EvaluationError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EvaluationError::Query(format!("reading {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            EvaluationError::Query(format!("parsing {}: {}", self.path.display(), e))
        })
    }
}

/// Expression of the query used as the rule's condition
pub fn condition_expr(rule: &AlertRule) -> Option<&str> {
    rule.data
        .iter()
        .find(|q| q.ref_id == rule.condition)
        .and_then(|q| q.model.get("expr"))
        .and_then(|v| v.as_str())
}

#[async_trait]
impl ConditionEvaluator for SnapshotEvaluator {
    async fn evaluate(
        &self,
        rule: &AlertRule,
        eval_time: DateTime<Utc>,
    ) -> std::result::Result<Results, EvaluationError> {
        let expr = condition_expr(rule).ok_or_else(|| {
            EvaluationError::Query(format!("query {} has no expr", rule.condition))
        })?;
        let condition = ThresholdCondition::parse(expr).map_err(EvaluationError::Query)?;
        let samples = self.load().await?;

        Ok(samples
            .into_iter()
            .filter(|s| s.metric == condition.metric)
            .map(|s| {
                let firing = condition.operator.evaluate(s.value, condition.threshold);
                let state = if firing {
                    EvalState::Alerting
                } else {
                    EvalState::Normal
                };
                EvalResult::new(s.labels, state, eval_time)
                    .with_value(rule.condition.clone(), s.value)
                    .with_evaluation_string(format!(
                        "[ var='{}' metric='{}' value={} ]",
                        rule.condition, s.metric, s.value
                    ))
            })
            .collect())
    }
}
