//! Error types for the resonance store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Duplicate pattern: {0}")]
    DuplicatePattern(String),

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Segment overflow: {0}")]
    SegmentOverflow(String),

    #[error("Incomplete write: {0}")]
    IncompleteWrite(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the error means segment content cannot be trusted,
    /// as opposed to a missing record or a caller mistake.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::IncompleteWrite(_))
    }
}
