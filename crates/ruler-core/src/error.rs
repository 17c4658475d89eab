//! Error types for ruler-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid interval for rule {uid}: {interval_seconds}s is not a positive multiple of {base_seconds}s")]
    InvalidInterval {
        uid: String,
        interval_seconds: i64,
        base_seconds: i64,
    },

    #[error("Rule {0} has no condition or the condition does not reference a query")]
    MissingCondition(String),

    #[error("Duplicate rule UID in submitted group: {0}")]
    DuplicateUid(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Version conflict for rule {uid}: expected version {expected}, found {actual}")]
    VersionConflict {
        uid: String,
        expected: i64,
        actual: i64,
    },

    #[error("Rule {uid} is provisioned by '{provenance}' and cannot be changed from '{requested}'")]
    ProvisionedRule {
        uid: String,
        provenance: String,
        requested: String,
    },

    #[error("Invalid state/reason combination: {0} / {1}")]
    InvalidStateReason(String, String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors the caller must resolve by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::VersionConflict { .. } | Error::ProvisionedRule { .. }
        )
    }

    /// Errors caused by an invalid submission.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidInterval { .. }
                | Error::MissingCondition(_)
                | Error::DuplicateUid(_)
                | Error::Validation(_)
                | Error::RuleNotFound(_)
        )
    }
}

impl From<chrono::ParseError> for Error {
    fn from(err: chrono::ParseError) -> Self {
        Error::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
