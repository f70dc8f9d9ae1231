//! Error taxonomy shared across the crate
//!
//! Validation errors surface to the immediate caller and are never retried
//! or silently defaulted. Computation errors wrap unexpected failures inside
//! simulation or training. Storage errors propagate persistence failures
//! without local retries. A loop fault terminates the learning loop and is
//! observable through its join handle.

use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum FusionError {
    /// Bad shape, width, or empty input; surfaced to the immediate caller
    #[error("validation error: {0}")]
    Validation(String),

    /// Unexpected failure inside simulation or training
    #[error("computation error: {0}")]
    Computation(String),

    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence failure from the SQLite backend
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Content or state failed to (de)serialize
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Uncaught error inside a learning cycle; terminates the loop
    #[error("learning loop fault: {0}")]
    LoopFault(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FusionError {
    /// Build a validation error naming the expected and actual width
    pub fn width_mismatch(what: &str, expected: usize, actual: usize) -> Self {
        FusionError::Validation(format!(
            "{what}: expected width {expected}, got {actual}"
        ))
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_mismatch_message() {
        let err = FusionError::width_mismatch("input", 4, 3);
        assert_eq!(
            err.to_string(),
            "validation error: input: expected width 4, got 3"
        );
    }
}
