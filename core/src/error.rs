//! Booking error taxonomy.
//!
//! Every guard in the core reports one of these. `DuplicateWebhook` is an
//! idempotency short-circuit rather than a failure; the runtime absorbs it.

use crate::types::{AssignmentId, BookingId, Money, TimeWindow, WorkerId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

/// Result alias for core operations
pub type BookingResult<T> = Result<T, BookingError>;

/// Typed rejection raised by the booking core
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingError {
    /// Another hold or booking occupies the requested window
    #[error("slot {window} is taken ({occupied} of {capacity} places occupied)")]
    SlotConflict {
        /// Requested window including trailing buffer
        window: TimeWindow,
        /// First conflicting claim window, if known
        conflicting: Option<TimeWindow>,
        /// Overlapping claims found
        occupied: usize,
        /// Capacity of the slot key
        capacity: u32,
    },

    /// Requested window is outside working hours or on a non-working day
    #[error("requested window {window} is outside working hours")]
    OutsideWorkingHours {
        /// Requested service window
        window: TimeWindow,
    },

    /// Requested date is beyond the advance-booking horizon
    #[error("bookings are accepted up to {latest}; requested {start}")]
    TooFarInAdvance {
        /// Requested start
        start: DateTime<Utc>,
        /// Last bookable local date
        latest: NaiveDate,
    },

    /// Requested start lies in the past
    #[error("requested start {start} is in the past")]
    StartInPast {
        /// Requested start
        start: DateTime<Utc>,
    },

    /// The booking's hold lapsed before the operation arrived
    #[error("hold for booking {booking_id} expired at {expired_at}")]
    HoldExpired {
        /// Booking ID
        booking_id: BookingId,
        /// Expiry instant
        expired_at: DateTime<Utc>,
    },

    /// Payment amount or segment plan does not match what is due
    #[error("payment mismatch: expected {expected}, received {received}")]
    PaymentMismatch {
        /// Amount due
        expected: Money,
        /// Amount presented
        received: Money,
    },

    /// Worker already has an active assignment inside the padded window
    #[error("worker {worker_id} is busy within {window}")]
    BufferConflict {
        /// Worker ID
        worker_id: WorkerId,
        /// Padded window of the conflicting reservation
        window: TimeWindow,
    },

    /// Dispatch ran out of eligible candidates
    #[error("no available worker for booking {booking_id} ({remaining_candidates} candidates remaining)")]
    NoAvailableWorker {
        /// Booking ID
        booking_id: BookingId,
        /// Eligible candidates left untried
        remaining_candidates: usize,
    },

    /// State machine guard failure
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Attempted action
        action: String,
    },

    /// Webhook or payment reference already processed
    #[error("payment reference {reference} already processed")]
    DuplicateWebhook {
        /// Gateway reference
        reference: String,
    },

    /// Completion code did not match
    #[error("invalid completion code")]
    InvalidOtp,

    /// Assignment belongs to a different worker
    #[error("assignment {assignment_id} is not offered to this worker")]
    NotAssignedWorker {
        /// Assignment ID
        assignment_id: AssignmentId,
    },

    /// Referenced entity does not exist
    #[error("{resource} {id} not found")]
    NotFound {
        /// Resource kind
        resource: String,
        /// Resource identifier
        id: String,
    },

    /// Malformed request
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong
        message: String,
    },
}

impl BookingError {
    /// Shorthand for an `InvalidTransition`
    pub fn transition(from: impl std::fmt::Display, action: &str) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            action: action.to_string(),
        }
    }

    /// Shorthand for a `NotFound`
    pub fn not_found(resource: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for an `InvalidRequest`
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SlotConflict { .. } => "SLOT_CONFLICT",
            Self::OutsideWorkingHours { .. } => "OUTSIDE_WORKING_HOURS",
            Self::TooFarInAdvance { .. } => "TOO_FAR_IN_ADVANCE",
            Self::StartInPast { .. } => "START_IN_PAST",
            Self::HoldExpired { .. } => "HOLD_EXPIRED",
            Self::PaymentMismatch { .. } => "PAYMENT_MISMATCH",
            Self::BufferConflict { .. } => "BUFFER_CONFLICT",
            Self::NoAvailableWorker { .. } => "NO_AVAILABLE_WORKER",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::DuplicateWebhook { .. } => "DUPLICATE_WEBHOOK",
            Self::InvalidOtp => "INVALID_OTP",
            Self::NotAssignedWorker { .. } => "NOT_ASSIGNED_WORKER",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
        }
    }

    /// Idempotency short-circuits that callers treat as success
    #[must_use]
    pub const fn is_absorbed(&self) -> bool {
        matches!(self, Self::DuplicateWebhook { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_screaming_snake_case() {
        let err = BookingError::transition("held", "start");
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(err.to_string(), "cannot start while held");
    }

    #[test]
    fn only_duplicate_webhook_is_absorbed() {
        assert!(
            BookingError::DuplicateWebhook {
                reference: "pay_1".into()
            }
            .is_absorbed()
        );
        assert!(!BookingError::InvalidOtp.is_absorbed());
    }

    #[test]
    fn serializes_with_code_tag() {
        let json = serde_json::to_value(BookingError::InvalidOtp).unwrap_or_default();
        assert_eq!(json["code"], "INVALID_OTP");
    }
}
