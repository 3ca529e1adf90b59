//! Error types for webaudit-core.

use thiserror::Error;

/// Result type alias using webaudit-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during audit orchestration.
///
/// Analyzer failures never surface through this type: the supervisor
/// converts them into degraded results. Orchestration itself only fails
/// with `Cancelled` or `Internal`.
#[derive(Error, Debug)]
pub enum Error {
    /// Timeout during an operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The caller's cancellation signal fired
    #[error("Audit cancelled by caller")]
    Cancelled,

    /// An iteration, page, or time budget was exhausted
    #[error("Budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// Illegal consensus status transition
    #[error("Invalid consensus transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Circuit breaker rejected the call
    #[error("Circuit open for analyzer {0}")]
    CircuitOpen(String),

    /// Analyzer returned a malformed or contract-violating result
    #[error("Analyzer contract violation: {analyzer} - {message}")]
    AnalyzerContract { analyzer: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unrecoverable internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create an analyzer contract violation error.
    pub fn analyzer_contract(analyzer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AnalyzerContract {
            analyzer: analyzer.into(),
            message: message.into(),
        }
    }

    /// Whether this error terminates the audit rather than degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Internal(_))
    }
}
