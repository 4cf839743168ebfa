//! Adapter error taxonomy.
//!
//! One closed set of error kinds is used in HTTP envelopes and logs. The
//! propagation policy: transient OFD failures are absorbed by the buffer,
//! permanent OFD failures surface through the dead-letter queue, and only
//! local contract violations (invalid request, buffer full, refund blocked)
//! ever reach the POS caller.

use serde::Serialize;
use thiserror::Error;

use crate::models::ReceiptStatus;

/// Machine-readable code carried in every HTTP error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    BufferFull,
    DuplicateKey,
    InvalidRequest,
    RefundBlocked,
    CircuitOpen,
    UpstreamTransient,
    UpstreamPermanent,
    KKTUnavailable,
    LockContention,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BufferFull => "BufferFull",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::RefundBlocked => "RefundBlocked",
            ErrorCode::CircuitOpen => "CircuitOpen",
            ErrorCode::UpstreamTransient => "UpstreamTransient",
            ErrorCode::UpstreamPermanent => "UpstreamPermanent",
            ErrorCode::KKTUnavailable => "KKTUnavailable",
            ErrorCode::LockContention => "LockContention",
            ErrorCode::Internal => "Internal",
        }
    }

    /// Whether the caller may usefully retry the same request as-is.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::CircuitOpen
                | ErrorCode::UpstreamTransient
                | ErrorCode::LockContention
                | ErrorCode::Internal
        )
    }
}

/// Failures that surface at the Adapter's own API boundary.
///
/// Upstream classification (transient vs permanent) lives in
/// [`crate::ofd::OfdOutcome`] and never converts into this type: the sync
/// machinery consumes it before any caller could see it.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("buffer full: {in_flight}/{capacity} receipts pending or syncing")]
    BufferFull { in_flight: usize, capacity: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("refund blocked: antecedent {original_id} is {}", .status.as_str())]
    RefundBlocked {
        original_id: String,
        status: ReceiptStatus,
    },

    #[error("a sync cycle already holds the lock")]
    LockContention,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdapterError::BufferFull { .. } => ErrorCode::BufferFull,
            AdapterError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            AdapterError::RefundBlocked { .. } => ErrorCode::RefundBlocked,
            AdapterError::LockContention => ErrorCode::LockContention,
            AdapterError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable_strings() {
        assert_eq!(ErrorCode::BufferFull.as_str(), "BufferFull");
        assert_eq!(ErrorCode::RefundBlocked.as_str(), "RefundBlocked");
        assert_eq!(ErrorCode::LockContention.as_str(), "LockContention");
    }

    #[test]
    fn test_retryability_policy() {
        assert!(!ErrorCode::BufferFull.retryable());
        assert!(!ErrorCode::InvalidRequest.retryable());
        assert!(!ErrorCode::RefundBlocked.retryable());
        assert!(ErrorCode::LockContention.retryable());
        assert!(ErrorCode::UpstreamTransient.retryable());
    }
}
