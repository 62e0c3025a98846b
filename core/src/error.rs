use crate::types::{ExceptionId, ExceptionState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DqError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown risk factor '{id}'")]
    UnknownRiskFactor { id: String },

    #[error("Exception {id} not found")]
    ExceptionNotFound { id: ExceptionId },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ExceptionState,
        to: ExceptionState,
    },

    #[error("Transition to {to} requires a non-empty comment")]
    CommentRequired { to: ExceptionState },

    #[error("Rule '{rule_code}' skipped: insufficient data (needs {needed}, has {available})")]
    InsufficientData {
        rule_code: String,
        needed: usize,
        available: usize,
    },

    #[error("Rule '{rule_code}' failed for {risk_factor_id}: {reason}")]
    RuleEvaluation {
        rule_code: String,
        risk_factor_id: String,
        reason: String,
    },

    #[error("No configured source has a value for {risk_factor_id} on {date}")]
    SourceUnavailable {
        risk_factor_id: String,
        date: chrono::NaiveDate,
    },

    #[error("Concurrent write on {key}")]
    PersistenceConflict { key: String },

    #[error("Run aborted: {reason}")]
    RunAborted { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DqResult<T> = Result<T, DqError>;
