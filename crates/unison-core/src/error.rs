use thiserror::Error;

/// Errors shared across the unison crates.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying store failure (connection, query, subscription).
    #[error("Store error: {0}")]
    Store(String),

    /// The advisory-lock session was already closed when it was used.
    #[error("Lock session closed")]
    SessionClosed,

    /// No schedule rule with the given ID exists in the store.
    #[error("Rule not found: {id}")]
    RuleNotFound { id: i64 },

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
