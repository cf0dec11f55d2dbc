//! Error types for the event ingestion core

use thiserror::Error;

/// Result type for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that can occur around event intake
///
/// Nothing on the intake path returns these to the caller. Malformed events
/// are converted into a quarantine outcome, effect failures into
/// `EffectFailed`. These errors surface only from configuration, setup and
/// the dispatcher plumbing.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration value missing or out of range
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event failed structural validation before classification
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Identity could not be derived under the configured policy
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// The dispatcher (or a partition worker) is no longer accepting deliveries
    #[error("Dispatcher closed: {0}")]
    DispatcherClosed(String),

    /// Tracing subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Check if the error describes a malformed event
    ///
    /// Malformed events are routed to quarantine rather than reported as errors.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidEvent(_) | IngestError::IdentityUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_malformed() {
        assert!(IngestError::InvalidEvent("empty".into()).is_malformed());
        assert!(IngestError::IdentityUnavailable("no key".into()).is_malformed());
        assert!(!IngestError::Config("bad ttl".into()).is_malformed());
        assert!(!IngestError::DispatcherClosed("gone".into()).is_malformed());
    }
}
