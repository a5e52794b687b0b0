//! Error types for the resources crate.

use strata_types::{ErrorCategory, ErrorClassification, Recoverability, ReservationId, Severity};
use thiserror::Error;

/// Result type alias using the resource error type.
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Error type for resource ledger operations.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No allocation exists for the reservation.
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// The reservation was already finalized.
    #[error("Reservation already finalized: {0}")]
    AlreadyFinalized(ReservationId),

    /// A quota or rate limit refused the request.
    #[error("Quota exceeded for '{resource_type}': {reason}")]
    QuotaExceeded {
        resource_type: String,
        reason: String,
    },
}

impl ResourceError {
    /// Classify this error for recovery strategy selection.
    pub fn classify(&self) -> ErrorClassification {
        match self {
            ResourceError::QuotaExceeded { .. } => {
                ErrorClassification::new(Severity::Warning, ErrorCategory::Resource)
            }
            ResourceError::ReservationNotFound(_) | ResourceError::AlreadyFinalized(_) => {
                ErrorClassification::new(Severity::Error, ErrorCategory::Logic)
                    .with_recoverability(Recoverability::None)
            }
        }
    }
}
