//! Error types for the purchase runner.
//!
//! Only conditions that must abort *all* scheduling are modeled as errors.
//! Recoverable per-attempt conditions (item not found, unreadable price,
//! unknown purchase outcome) are logged where they occur and surface as a
//! zero-quantity attempt instead of an `Err`.

use std::time::Duration;

/// Fatal conditions that unwind to the active scheduler and terminate all
/// task execution.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// Required configuration is missing or unusable (executable path,
    /// launch-button template, indicator templates).
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    /// The target never became interactable within the startup timeout.
    #[error("startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// The OCR backend failed in a way that retrying cannot fix.
    #[error("OCR backend failure: {0}")]
    ServiceFatal(String),

    /// Recovery after a periodic restart did not reach the ready state.
    #[error("restart recovery failed: {0}")]
    RestartFailure(String),
}

/// Convenience result type for runner operations.
pub type Result<T> = std::result::Result<T, FatalError>;

/// OCR call outcome split by severity.
///
/// `Service` errors are transient (HTTP hiccup, timeout, low-confidence
/// output) and the caller falls back or skips the attempt. `Fatal` errors
/// indicate the backend itself is broken and must become
/// [`FatalError::ServiceFatal`].
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    /// Recoverable service error; the attempt yields no price.
    #[error("OCR service error: {0}")]
    Service(String),

    /// Unrecoverable backend error; aborts all scheduling.
    #[error("OCR backend fatal: {0}")]
    Fatal(String),
}

impl OcrError {
    /// Whether this error must abort all scheduling.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
