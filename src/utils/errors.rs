// src/utils/errors.rs
//! Engine error types
//!
//! Every fallible operation in the crate returns [`Result`]. Capture-path
//! callers never surface these to the exchange; they log and fail open.

use thiserror::Error;

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the interception engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The durable flow store could not be read or written
    #[error("Flow store unavailable: {0}")]
    StoreUnavailable(String),

    /// Edited request bytes failed framing validation
    #[error("Malformed edited request: {0}")]
    MalformedEditedRequest(String),

    /// Edited request targets a different host than the original connection
    #[error("Edited request targets {edited}, but flow was captured for {original}")]
    EditTargetMismatch {
        /// Host of the captured flow
        original: String,
        /// Host named by the edited request
        edited: String,
    },

    /// No record exists for the flow id
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// The flow exists but was never intercepted
    #[error("Flow {0} is not pending interception")]
    FlowNotPending(String),

    /// Captured request bytes could not be indexed
    #[error("Unparseable request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Logging/metrics setup failed
    #[error("Observability setup failed: {0}")]
    ObservabilityFailed(String),
}

impl EngineError {
    /// Whether this error means the store itself is unreachable
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }

    /// Whether this error rejects an edit while leaving the flow blocked
    pub fn is_edit_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::MalformedEditedRequest(_) | EngineError::EditTargetMismatch { .. }
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StoreUnavailable(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let err: EngineError = rusqlite::Error::InvalidQuery.into();
        assert!(err.is_store_unavailable());
        assert!(!err.is_edit_rejection());
    }

    #[test]
    fn test_edit_rejection_kinds() {
        let malformed = EngineError::MalformedEditedRequest("no request line".into());
        let mismatch = EngineError::EditTargetMismatch {
            original: "a.test".into(),
            edited: "b.test".into(),
        };
        assert!(malformed.is_edit_rejection());
        assert!(mismatch.is_edit_rejection());
        assert!(mismatch.to_string().contains("b.test"));
    }
}
