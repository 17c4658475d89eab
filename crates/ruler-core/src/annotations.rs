//! State-transition annotations
//!
//! Every change of an instance's state or reason is described by an
//! [`AnnotationEntry`] and handed to an [`AnnotationSink`]. Saving is
//! fire-and-forget: failures are logged, never propagated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::labels::Labels;
use crate::rule::AlertRule;
use crate::state::StateTransition;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub org_id: i64,
    pub rule_uid: String,
    pub rule_title: String,
    pub labels: Labels,
    pub previous: String,
    pub current: String,
    pub time: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl AnnotationEntry {
    pub fn from_transition(rule: &AlertRule, transition: &StateTransition) -> Self {
        let instance = &transition.instance;
        Self {
            org_id: rule.org_id,
            rule_uid: rule.uid.clone(),
            rule_title: rule.title.clone(),
            labels: instance.labels.clone(),
            previous: describe(transition.previous_state.as_str(), &transition.previous_reason.to_string()),
            current: describe(instance.state().as_str(), &instance.reason().to_string()),
            time: instance.last_evaluation_time,
            values: instance.values.clone(),
        }
    }
}

fn describe(state: &str, reason: &str) -> String {
    if reason.is_empty() || reason == state {
        state.to_string()
    } else {
        format!("{} ({})", state, reason)
    }
}

#[async_trait]
pub trait AnnotationSink: Send + Sync {
    async fn save(&self, entry: AnnotationEntry) -> Result<()>;
}

/// Writes annotations to the log
pub struct LogAnnotationSink;

#[async_trait]
impl AnnotationSink for LogAnnotationSink {
    async fn save(&self, entry: AnnotationEntry) -> Result<()> {
        info!(
            org_id = entry.org_id,
            rule_uid = %entry.rule_uid,
            previous = %entry.previous,
            current = %entry.current,
            labels = ?entry.labels,
            "Alert state changed"
        );
        Ok(())
    }
}
