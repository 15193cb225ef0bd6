//! Error types for the booking runtime

use crate::gateway::GatewayError;
use booking_core::error::BookingError;
use booking_core::types::BookingId;
use thiserror::Error;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// Booking does not exist
    #[error("booking {0} not found")]
    NotFound(BookingId),

    /// A storage-level invariant refused the write (slot capacity, buffer
    /// exclusion). Carries the domain error for the caller.
    #[error(transparent)]
    Conflict(BookingError),

    /// State could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend unreachable or timed out
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Failures surfaced by [`crate::service::BookingService`]
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Domain rejection
    #[error(transparent)]
    Booking(#[from] BookingError),

    /// Persistence failure
    #[error(transparent)]
    Store(StoreError),

    /// Payment gateway failure
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl ServiceError {
    /// Domain error, if this is one
    #[must_use]
    pub const fn booking(&self) -> Option<&BookingError> {
        match self {
            Self::Booking(error) => Some(error),
            _ => None,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(error) => Self::Booking(error),
            StoreError::NotFound(id) => Self::Booking(BookingError::not_found("booking", id)),
            other => Self::Store(other),
        }
    }
}

/// Result alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
