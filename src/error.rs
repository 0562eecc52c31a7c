//! Unified error hierarchy for strainguard
//!
//! Assessment cycles never surface these to the wearer: collaborator failures are
//! logged and swallowed by the session. The types exist so that the storage,
//! inference and notification layers can report precisely what went wrong.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for all strainguard operations
#[derive(Debug, Error)]
pub enum StrainError {
    /// Document or local key-value store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Heat-strain feature extraction or scoring errors
    #[error("Heat strain error: {0}")]
    HeatStrain(#[from] HeatStrainError),

    /// Group notification dispatch errors
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors for the document store and the local key-value store
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Document body could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local state file could not be read or written
    #[error("Local state file {path}: {reason}")]
    LocalState { path: PathBuf, reason: String },

    /// A store lock was poisoned by a panicking writer
    #[error("Store lock poisoned: {0}")]
    LockPoisoned(String),

    /// Record not found
    #[error("Record not found: {collection}/{name}")]
    NotFound { collection: String, name: String },
}

/// Heat-strain pipeline errors. Every variant maps to "unavailable" for the cycle.
#[derive(Debug, Error)]
pub enum HeatStrainError {
    /// Transport failure talking to the inference service
    #[error("Inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("Inference service returned status {status}")]
    Status { status: u16 },

    /// Response body was not the expected feature map
    #[error("Malformed feature response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A feature the model needs is absent or non-numeric
    #[error("Missing feature: {key}")]
    MissingFeature { key: String },

    /// A model weight names a feature the extractor never produces
    #[error("Unknown feature: {key}")]
    UnknownFeature { key: String },

    /// Not enough raw samples to compute statistics
    #[error("Insufficient data for {channel}: {reason}")]
    InsufficientData { channel: String, reason: String },

    /// The predictive model produced a non-finite score
    #[error("Model produced an invalid score: {0}")]
    InvalidScore(f64),
}

/// Notification dispatch errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Transport failure talking to the notification server
    #[error("Notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Notification server returned status {status}")]
    Status { status: u16 },
}

/// Result type alias for strainguard operations
pub type Result<T> = std::result::Result<T, StrainError>;

impl StrainError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrainError::HeatStrain(HeatStrainError::Request(_))
                | StrainError::Notify(NotifyError::Request(_))
                | StrainError::Storage(StorageError::Sqlite(_))
                | StrainError::Io(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StrainError::HeatStrain(HeatStrainError::InsufficientData { .. }) => ErrorSeverity::Info,
            StrainError::HeatStrain(_) => ErrorSeverity::Warning,
            StrainError::Notify(_) => ErrorSeverity::Warning,
            StrainError::Storage(StorageError::NotFound { .. }) => ErrorSeverity::Warning,
            StrainError::Validation(_) => ErrorSeverity::Warning,
            StrainError::Storage(StorageError::LockPoisoned(_)) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            StrainError::HeatStrain(_) => {
                "Heat strain is unavailable right now; it will update on the next reading.".to_string()
            }
            StrainError::Notify(_) => {
                "Your group could not be notified. The warning is still saved.".to_string()
            }
            StrainError::Storage(StorageError::NotFound { collection, name }) => {
                format!("No saved {} entry named {}", collection, name)
            }
            StrainError::Configuration(reason) => {
                format!("Configuration problem: {}", reason)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = StrainError::HeatStrain(HeatStrainError::MissingFeature {
            key: "PPG_Mean".to_string(),
        });
        assert_eq!(err.severity(), ErrorSeverity::Warning);

        let err = StrainError::Storage(StorageError::LockPoisoned("documents".to_string()));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_error_retryable() {
        let err = StrainError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(err.is_retryable());

        let err = StrainError::Validation("test".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_user_messages() {
        let err = StrainError::Storage(StorageError::NotFound {
            collection: "users".to_string(),
            name: "p1".to_string(),
        });
        assert!(err.user_message().contains("users"));

        let err: StrainError = HeatStrainError::Status { status: 503 }.into();
        assert!(err.user_message().contains("unavailable"));
    }
}
