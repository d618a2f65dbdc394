use seedkeeper_engine::{EngineError, MetainfoError};

use crate::fetch::FetchError;
use crate::policy::Rejection;

/// Errors a submitted transfer can end with.
///
/// Cancellation is not an error; it is reported through
/// [`crate::executor::TransferOutcome`] instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("metadata not available after {secs}s")]
    MetadataTimeout { secs: u64 },
    #[error("rejected: {0}")]
    PolicyRejected(Rejection),
    #[error("a transfer is already active for session {0}")]
    AlreadyActive(String),
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
    /// The caller withdrew the transfer before it was admitted.
    #[error("cancelled before the transfer started")]
    Cancelled,
    #[error("descriptor fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

impl TransferError {
    /// Whether resubmitting the same descriptor might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::MetadataTimeout { .. } | TransferError::Fetch(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::InvalidDescriptor(_) => "invalid_descriptor",
            TransferError::MetadataTimeout { .. } => "metadata_timeout",
            TransferError::PolicyRejected(_) => "policy_rejected",
            TransferError::AlreadyActive(_) => "already_active",
            TransferError::Engine(_) => "engine_failure",
            TransferError::ShuttingDown => "shutting_down",
            TransferError::Cancelled => "cancelled",
            TransferError::Fetch(_) => "fetch_failed",
        }
    }
}

impl From<EngineError> for TransferError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidDescriptor(msg) => TransferError::InvalidDescriptor(msg),
            other => TransferError::Engine(other.to_string()),
        }
    }
}

impl From<MetainfoError> for TransferError {
    fn from(err: MetainfoError) -> Self {
        TransferError::InvalidDescriptor(err.to_string())
    }
}

impl From<Rejection> for TransferError {
    fn from(rejection: Rejection) -> Self {
        TransferError::PolicyRejected(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_invalid_descriptor_keeps_its_kind() {
        let err: TransferError = EngineError::InvalidDescriptor("bad".into()).into();
        assert_eq!(err, TransferError::InvalidDescriptor("bad".into()));
        let err: TransferError = EngineError::Closed.into();
        assert_eq!(err.kind(), "engine_failure");
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TransferError::MetadataTimeout { secs: 120 }.is_retryable());
        assert!(!TransferError::InvalidDescriptor("x".into()).is_retryable());
        assert!(!TransferError::AlreadyActive("42".into()).is_retryable());
    }
}
