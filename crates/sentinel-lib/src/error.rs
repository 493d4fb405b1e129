//! Error types shared across the sentinel library

use crate::models::AlertStatus;
use thiserror::Error;

/// Failures reported by metric sources and persistence backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable")]
    Unavailable,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Internal analyzer failures. Never escape `detect_anomalies`/`predict_issues`.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("not enough samples to fit model: {have} < {need}")]
    InsufficientSamples { have: usize, need: usize },

    #[error("numerical failure: {0}")]
    Numerical(String),
}

/// Errors surfaced by alert lifecycle operations
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },

    /// Cause is logged, not exposed to callers
    #[error("alert operation failed")]
    OperationFailed,
}

/// Notification delivery failures
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("email delivery failed: {0}")]
    Email(String),

    #[error("no recipients configured")]
    NoRecipients,

    #[error("invalid webhook url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
