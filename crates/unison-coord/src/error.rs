use thiserror::Error;

/// Errors surfaced by coordinator operations.
///
/// Lock contention and connection loss never appear here — they are
/// steady-state signals recovered by retry and recorded as skip outcomes.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Store error: {0}")]
    Store(#[from] unison_core::error::CoreError),

    #[error("No handler registered for job '{name}'")]
    UnknownHandler { name: String },
}

pub type Result<T> = std::result::Result<T, CoordError>;

/// Error returned by a job body. Opaque to the coordinator — it is
/// recorded in the `failed` outcome and never propagated further.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
