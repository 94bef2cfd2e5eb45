//! Error types for batchwise.
//!
//! Failure taxonomy:
//! - Transient: worth another attempt (timeouts, flaky I/O, explicit transient)
//! - Isolated: a single unit failed; recorded as a failure slot, siblings continue
//! - Recovery: checkpoint records missing, truncated or colliding
//! - Configuration: rejected at construction, never at first use

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for batchwise.
#[derive(Debug, Error)]
pub enum EtlError {
    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION: rejected before any work runs
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // TRANSIENT: a later attempt may succeed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // PROCESSING: unit or step level failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Step '{step}' failed: {failed} of {total} units did not complete")]
    StepFailed {
        step: String,
        failed: usize,
        total: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ═══════════════════════════════════════════════════════════════════
    // RECOVERY: checkpoint store failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL: invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Checkpoint store failures.
///
/// Kept as a distinct class so a resuming caller can decide to start over.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Checkpoint id collision: {0}")]
    Collision(String),

    #[error("Checkpoint storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Coarse failure category used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Timeout,
    Io,
    Processing,
    Checkpoint,
    Config,
    Internal,
}

/// Anything a retry policy can classify.
pub trait Categorized {
    fn category(&self) -> ErrorCategory;
}

impl EtlError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Convenience for unit functions signalling a retryable hiccup.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Whether this error belongs to the checkpoint/recovery class.
    pub fn is_recovery_failure(&self) -> bool {
        matches!(self, Self::Checkpoint(_))
    }
}

impl Categorized for EtlError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::InvalidInput(_) => ErrorCategory::Config,
            Self::Transient(_) => ErrorCategory::Transient,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Io { .. } => ErrorCategory::Io,
            Self::Processing(_)
            | Self::StepFailed { .. }
            | Self::Serialization(_) => ErrorCategory::Processing,
            Self::Checkpoint(_) => ErrorCategory::Checkpoint,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<serde_json::Error> for EtlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for batchwise.
pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            EtlError::transient("flaky").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            EtlError::Timeout(Duration::from_secs(1)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            EtlError::processing("bad row").category(),
            ErrorCategory::Processing
        );
        let cp: EtlError = CheckpointError::NotFound("abc".to_string()).into();
        assert_eq!(cp.category(), ErrorCategory::Checkpoint);
        assert!(cp.is_recovery_failure());
    }

    #[test]
    fn test_io_context_in_message() {
        let err = EtlError::io(
            "writing state",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(err.to_string(), "IO error: writing state");
        assert!(std::error::Error::source(&err).is_some());
    }
}
