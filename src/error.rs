//! Engine error types.
//!
//! [`EscrowError`] is the central error type for the crate. Every variant
//! except [`EscrowError::Persistence`] is a local, recoverable condition the
//! caller can render to the acting user; persistence failures are the only
//! class that should abort the whole operation ("temporarily unavailable,
//! retry").

use uuid::Uuid;

use crate::domain::DealId;

/// Engine-side error enum.
///
/// # Variant Classes
///
/// | Class                  | Variants                                   |
/// |------------------------|--------------------------------------------|
/// | Rejected before write  | `Validation`                               |
/// | Guard failure          | `PermissionDenied`, `InvalidTransition`    |
/// | Lost race              | `ConcurrentModification`                   |
/// | Degraded               | `DependencyMissing`                        |
/// | Lookup                 | `DealNotFound`, `DealTokenNotFound`, `PaymentRequestNotFound` |
/// | Abort                  | `Persistence`                              |
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    /// Request was malformed and rejected before anything was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The acting user's role does not permit the requested action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The action is not legal from the deal's current status/flags.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The compare-and-set write lost a race with a concurrent action on
    /// the same deal. The caller should reload and retry.
    #[error("deal {0} was modified concurrently")]
    ConcurrentModification(DealId),

    /// A required external record is missing (e.g. the seller has no
    /// payment details on file). Degrades to a notification, not a crash.
    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    /// Deal with the given ID was not found.
    #[error("deal not found: {0}")]
    DealNotFound(DealId),

    /// No deal carries the given deep-link token.
    #[error("no deal for token {0}")]
    DealTokenNotFound(Uuid),

    /// Payment request with the given ID was not found.
    #[error("payment request not found: {0}")]
    PaymentRequestNotFound(i64),

    /// Persistence layer failure. The only abort-class error.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EscrowError {
    /// Returns `true` if the condition is local and recoverable: the caller
    /// can render a user-facing message and carry on. Only persistence
    /// failures are non-recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Persistence(_))
    }

    /// Returns `true` if the caller should reload the deal and retry the
    /// same action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }
}

impl From<sqlx::Error> for EscrowError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn persistence_is_not_recoverable() {
        let err = EscrowError::Persistence("connection refused".to_string());
        assert!(!err.is_recoverable());
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflict_is_retryable() {
        let err = EscrowError::ConcurrentModification(DealId::new(7));
        assert!(err.is_recoverable());
        assert!(err.is_retryable());
    }

    #[test]
    fn guard_failures_are_recoverable() {
        let err = EscrowError::InvalidTransition("already accepted".to_string());
        assert!(err.is_recoverable());
        assert!(!err.is_retryable());
    }
}
