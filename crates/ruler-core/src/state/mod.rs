//! Alert instance state
//!
//! This module provides:
//! - The primary instance state and its reason, combined in [`Status`]
//! - [`AlertInstance`], the unit of alert state
//! - The in-memory [`StateCache`] and the reconciling [`StateManager`]

pub mod cache;
pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::eval::EvalState;
use crate::labels::{Fingerprint, Labels};
use crate::rule::AlertRuleKey;
use crate::{Error, Result};

pub use cache::StateCache;
pub use manager::{StateConfig, StateManager};

/// Primary state of an alert instance. Only this participates in routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertState {
    Normal,
    Pending,
    Alerting,
    NoData,
    Error,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Pending => "Pending",
            Self::Alerting => "Alerting",
            Self::NoData => "NoData",
            Self::Error => "Error",
        }
    }

    /// States that are forwarded as firing alerts
    pub fn is_firing(&self) -> bool {
        matches!(self, Self::Alerting | Self::NoData | Self::Error)
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Normal" => Ok(Self::Normal),
            "Pending" => Ok(Self::Pending),
            "Alerting" => Ok(Self::Alerting),
            "NoData" => Ok(Self::NoData),
            "Error" => Ok(Self::Error),
            _ => Err(Error::Parse(format!("Invalid alert state: {}", s))),
        }
    }
}

/// Why an instance is in its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateReason {
    /// Mirrors the state the evaluator reported
    Evaluated(EvalState),
    /// The rule's policy kept the previous state for this evaluator state
    KeepLast(EvalState),
    MissingSeries,
    RuleDeleted,
    Paused,
    Updated,
}

impl std::fmt::Display for StateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Evaluated(s) => f.write_str(s.as_str()),
            Self::KeepLast(s) => write!(f, "{}, KeepLast", s.as_str()),
            Self::MissingSeries => f.write_str("MissingSeries"),
            Self::RuleDeleted => f.write_str("RuleDeleted"),
            Self::Paused => f.write_str("Paused"),
            Self::Updated => f.write_str("Updated"),
        }
    }
}

impl std::str::FromStr for StateReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        fn eval_state(s: &str) -> Result<EvalState> {
            match s {
                "Normal" => Ok(EvalState::Normal),
                "Alerting" => Ok(EvalState::Alerting),
                "NoData" => Ok(EvalState::NoData),
                "Error" => Ok(EvalState::Error),
                _ => Err(Error::Parse(format!("Invalid state reason: {}", s))),
            }
        }

        match s {
            "MissingSeries" => Ok(Self::MissingSeries),
            "RuleDeleted" => Ok(Self::RuleDeleted),
            "Paused" => Ok(Self::Paused),
            "Updated" => Ok(Self::Updated),
            _ => match s.strip_suffix(", KeepLast") {
                Some(inner) => Ok(Self::KeepLast(eval_state(inner)?)),
                None => Ok(Self::Evaluated(eval_state(s)?)),
            },
        }
    }
}

/// Whether `reason` may accompany `state`
pub fn is_allowed(state: AlertState, reason: StateReason) -> bool {
    use StateReason::*;

    match (state, reason) {
        (_, Evaluated(EvalState::Pending)) => false,
        (_, KeepLast(EvalState::NoData | EvalState::Error)) => true,
        (_, KeepLast(_)) => false,
        (AlertState::Normal, Evaluated(EvalState::Alerting)) => false,
        (AlertState::Normal, _) => true,
        (
            AlertState::Pending | AlertState::Alerting,
            Evaluated(EvalState::Alerting | EvalState::NoData | EvalState::Error),
        ) => true,
        (AlertState::NoData, Evaluated(EvalState::NoData)) => true,
        (AlertState::Error, Evaluated(EvalState::Error)) => true,
        _ => false,
    }
}

/// A state together with its reason. Only allowed combinations can be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    state: AlertState,
    reason: StateReason,
}

impl Status {
    pub fn new(state: AlertState, reason: StateReason) -> Result<Self> {
        if !is_allowed(state, reason) {
            return Err(Error::InvalidStateReason(
                state.to_string(),
                reason.to_string(),
            ));
        }
        Ok(Self { state, reason })
    }

    /// Built by the state machine, whose transitions only produce allowed pairs
    pub(crate) fn transition(state: AlertState, reason: StateReason) -> Self {
        debug_assert!(
            is_allowed(state, reason),
            "state machine produced {} / {}",
            state,
            reason
        );
        Self { state, reason }
    }

    pub fn normal() -> Self {
        Self {
            state: AlertState::Normal,
            reason: StateReason::Evaluated(EvalState::Normal),
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    pub fn reason(&self) -> StateReason {
        self.reason
    }
}

/// Identity of an alert instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub rule: AlertRuleKey,
    pub fingerprint: Fingerprint,
}

/// One entry of an instance's rolling evaluation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSample {
    pub evaluated_at: DateTime<Utc>,
    pub state: EvalState,
    pub values: BTreeMap<String, f64>,
}

/// State of one series of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub org_id: i64,
    pub rule_uid: String,
    pub fingerprint: Fingerprint,
    /// Series labels returned by the evaluator
    pub labels: Labels,
    pub status: Status,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub last_evaluation_time: DateTime<Utc>,
    pub evaluation_duration: Duration,
    pub last_evaluation_string: String,
    pub error: Option<String>,
    pub values: BTreeMap<String, f64>,
    pub results: VecDeque<EvaluationSample>,
    /// Set for the evaluation that moved the instance out of a firing state
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl AlertInstance {
    pub fn new(rule: &AlertRuleKey, labels: Labels, now: DateTime<Utc>) -> Self {
        Self {
            org_id: rule.org_id,
            rule_uid: rule.uid.clone(),
            fingerprint: Fingerprint::of(&labels),
            labels,
            status: Status::normal(),
            starts_at: now,
            ends_at: now,
            last_evaluation_time: now,
            evaluation_duration: Duration::ZERO,
            last_evaluation_string: String::new(),
            error: None,
            values: BTreeMap::new(),
            results: VecDeque::new(),
            resolved: false,
            resolved_at: None,
            last_sent_at: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            rule: AlertRuleKey::new(self.org_id, self.rule_uid.clone()),
            fingerprint: self.fingerprint,
        }
    }

    pub fn state(&self) -> AlertState {
        self.status.state()
    }

    pub fn reason(&self) -> StateReason {
        self.status.reason()
    }

    /// Append to the rolling window, dropping the oldest entries beyond `max`
    pub fn push_result(&mut self, sample: EvaluationSample, max: usize) {
        self.results.push_back(sample);
        while self.results.len() > max.max(1) {
            self.results.pop_front();
        }
    }
}

/// Change of one instance produced by a reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub instance: AlertInstance,
    pub previous_state: AlertState,
    pub previous_reason: StateReason,
}

impl StateTransition {
    /// Whether state or reason changed
    pub fn changed(&self) -> bool {
        self.previous_state != self.instance.state()
            || self.previous_reason != self.instance.reason()
    }
}
