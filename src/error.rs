use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds of the curriculum core.
///
/// Functions return `anyhow::Result`; these are raised inside and can be
/// recovered with `err.downcast_ref::<CurriculumError>()` where a caller
/// needs to tell the recoverable kinds apart.
#[derive(Debug, Error)]
pub enum CurriculumError {
    /// Invalid or missing option. Fatal, raised before any training starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed historical episode log. The episode is skipped.
    #[error("corrupt episode log {path}: {reason}")]
    DataCorruption { path: PathBuf, reason: String },

    /// More transitions than the buffer was sized for.
    #[error("replay buffer capacity violated: {count} transitions for a maximum of {capacity}")]
    CapacityViolation { count: usize, capacity: usize },

    /// Batch request larger than the buffer contents.
    #[error("insufficient data: requested {requested} transitions, {available} available")]
    InsufficientData { requested: usize, available: usize },

    /// Saved replay buffer does not fit into the target buffer.
    #[error("saved replay buffer holds {saved} transitions, target capacity is {capacity}")]
    PersistenceMismatch { saved: usize, capacity: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CurriculumError {
    pub fn config(msg: impl Into<String>) -> Self {
        CurriculumError::Configuration(msg.into())
    }

    /// Whether the caller may skip or retry instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CurriculumError::DataCorruption { .. } | CurriculumError::InsufficientData { .. }
        )
    }
}

/// Typed view of an `anyhow` error raised by this crate, if it is one.
pub fn kind_of(err: &anyhow::Error) -> Option<&CurriculumError> {
    err.downcast_ref::<CurriculumError>()
}
