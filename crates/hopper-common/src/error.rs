//! Error types for hopper

use thiserror::Error;

/// Result type alias for hopper operations
pub type Result<T> = std::result::Result<T, HopperError>;

/// Main error type for hopper.
///
/// Variants fall into four classes with different handling policies:
/// transient infrastructure failures (retryable, release the claim),
/// permanent content failures (record and move on), configuration
/// failures (fail fast at startup), and schema/coordination failures
/// (fatal).
#[derive(Error, Debug)]
pub enum HopperError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Downstream API unavailable: {0}")]
    ApiUnavailable(String),

    #[error("Downstream API rejected record: {0}")]
    ApiRejected(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Schema bootstrap error: {0}")]
    Schema(String),
}

impl HopperError {
    /// True when a retry against the same target may succeed later.
    /// Transient failures never mark an entry complete; the allocation
    /// is released so another attempt can claim it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HopperError::Io(_)
                | HopperError::Storage(_)
                | HopperError::ApiUnavailable(_)
                | HopperError::Database(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HopperError::Storage("timeout".into()).is_transient());
        assert!(HopperError::ApiUnavailable("503".into()).is_transient());
        assert!(!HopperError::ApiRejected("400".into()).is_transient());
        assert!(!HopperError::Parse("bad json".into()).is_transient());
        assert!(!HopperError::Config("missing bucket".into()).is_transient());
    }
}
