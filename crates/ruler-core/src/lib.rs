//! Ruler Core - Alert rule model, evaluation and state reconciliation
//!
//! This crate provides the building blocks of the alert rule scheduler:
//! - Rule model, label fingerprints and evaluation jitter
//! - Evaluation pipeline over an external condition evaluator
//! - Alert instance state machine and state cache
//! - Rule group change calculation with optimistic locking
//! - SQLite and in-memory rule/instance stores
//! - Notification forwarding, annotations and metrics

pub mod annotations;
pub mod database;
#[cfg(test)]
mod database_tests;
pub mod error;
pub mod eval;
pub mod jitter;
pub mod labels;
pub mod metrics;
pub mod notify;
pub mod rule;
pub mod rule_group;
pub mod state;
pub mod store;

pub use annotations::{AnnotationEntry, AnnotationSink, LogAnnotationSink};
pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result};
pub use eval::{
    ConditionEvaluator, EvalResult, EvalState, EvaluationError, EvaluationPipeline, Results,
    SnapshotEvaluator,
};
pub use jitter::{jitter_offset_in_ticks, JitterStrategy};
pub use labels::{Fingerprint, Labels};
pub use metrics::Metrics;
pub use notify::{FinalizedAlert, LogForwarder, NotificationForwarder, WebhookForwarder};
pub use rule::{
    AlertQuery, AlertRule, AlertRuleGroupKey, AlertRuleKey, ExecErrState, NoDataState,
    NotificationSettings, Provenance,
};
pub use rule_group::{GroupDelta, RuleDelta};
pub use state::{
    AlertInstance, AlertState, InstanceKey, StateConfig, StateManager, StateReason,
    StateTransition, Status,
};
pub use store::{
    CommittedChanges, InstanceStore, MemoryInstanceStore, MemoryRuleStore, RuleFilter, RuleStore,
    RuleUpdate,
};
