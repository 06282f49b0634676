//! Error taxonomy for the governor core
//!
//! Budget and rate-limit denials are NOT errors; they are normal decision
//! values the caller branches on. Only malformed input, missing references,
//! policy conflicts and storage failures surface here.

use thiserror::Error;

/// Errors produced by the governor core
#[derive(Debug, Error)]
pub enum GovernorError {
    /// Malformed input; caller-fixable, never retried automatically
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reference to a nonexistent budget/policy/agent
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Two sibling policies at the same scope share a priority
    #[error("conflicting policies at {scope} '{scope_id}' with equal priority {priority}")]
    PolicyConflict {
        scope: String,
        scope_id: String,
        priority: u32,
    },

    /// Anomaly detection declines to score; logged, not alerted
    #[error("insufficient data: {actual} of {required} required samples")]
    InsufficientData { required: usize, actual: usize },

    /// Persistence-layer failure after retries at the storage boundary
    #[error("store error: {0}")]
    Store(String),
}

impl GovernorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GovernorError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        GovernorError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result alias used throughout the governor core
pub type Result<T> = std::result::Result<T, GovernorError>;
