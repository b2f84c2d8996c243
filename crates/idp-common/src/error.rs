//! Error types for the importer pipeline

use thiserror::Error;

/// Result type alias for importer operations
pub type Result<T> = std::result::Result<T, ImportError>;

/// Main error type for the importer pipeline
///
/// Variants are classified by how the orchestrator reacts to them:
/// configuration, source, format, and timeout errors are fatal to the
/// current attempt; persistence errors are scoped to one batch and may be
/// retried before the batch is recorded in the checkpoint note.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Persistence error: {message}")]
    Persistence { message: String, retryable: bool },

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ImportError {
    /// Shorthand for a retryable batch-level persistence failure
    pub fn persistence(message: impl Into<String>) -> Self {
        ImportError::Persistence {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a persistence failure that retrying cannot fix
    /// (constraint violations, serialization of bad data)
    pub fn persistence_permanent(message: impl Into<String>) -> Self {
        ImportError::Persistence {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether this error aborts the whole attempt (as opposed to a
    /// single batch or record)
    pub fn is_fatal_to_attempt(&self) -> bool {
        !matches!(self, ImportError::Persistence { .. })
    }

    /// Whether the failed operation may be retried in place
    pub fn is_retryable(&self) -> bool {
        match self {
            ImportError::Persistence { retryable, .. } => *retryable,
            ImportError::SourceUnavailable(_) | ImportError::Timeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_classification() {
        let transient = ImportError::persistence("connection reset");
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal_to_attempt());

        let permanent = ImportError::persistence_permanent("null value in column");
        assert!(!permanent.is_retryable());
        assert!(!permanent.is_fatal_to_attempt());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ImportError::Configuration("missing url".into()).is_fatal_to_attempt());
        assert!(ImportError::SourceUnavailable("dns".into()).is_fatal_to_attempt());
        assert!(ImportError::Format("no header row".into()).is_fatal_to_attempt());
        assert!(ImportError::Timeout("fetch".into()).is_fatal_to_attempt());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ImportError::SourceUnavailable("503".into()).is_retryable());
        assert!(ImportError::Timeout("write".into()).is_retryable());
        assert!(!ImportError::Format("bad xml".into()).is_retryable());
        assert!(!ImportError::Configuration("bad attr".into()).is_retryable());
    }
}
