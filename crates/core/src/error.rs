//! Errors raised while validating orchestration inputs.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of the pure layer.
///
/// Nothing in here is retryable: the same input always fails the same way.
/// Storage and transport failures live in the infra error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: an unknown provider, an empty resource class, a bad
    /// status string read back from storage.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A writer expected a record version that is no longer current.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// True for errors caused by caller input rather than concurrent writers.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, Self::VersionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_both_versions() {
        let err = DomainError::VersionConflict {
            expected: 2,
            actual: 5,
        };
        assert_eq!(err.to_string(), "version conflict: expected 2, found 5");
        assert!(!err.is_input_error());
        assert!(DomainError::validation("empty").is_input_error());
    }
}
