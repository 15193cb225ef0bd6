//! Domain events.
//!
//! Emitted by the state machine and published after the unit of work
//! commits. Notification, chat-room and analytics collaborators subscribe;
//! the core never delivers anything itself.

use crate::types::{
    Actor, AssignmentId, BookingId, BookingStatus, Money, PaymentMethod, SegmentId, TimeWindow, WorkerId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something that happened to a booking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    /// Slot held for a new booking
    HoldPlaced {
        /// Booking ID
        booking_id: BookingId,
        /// Service window
        window: TimeWindow,
        /// Hold expiry
        expires_at: DateTime<Utc>,
    },
    /// Customer initiated payment
    PaymentInitiated {
        /// Booking ID
        booking_id: BookingId,
        /// Payment method
        method: PaymentMethod,
        /// New hold expiry
        expires_at: DateTime<Utc>,
    },
    /// Segment paid
    SegmentPaid {
        /// Booking ID
        booking_id: BookingId,
        /// Segment ID
        segment_id: SegmentId,
        /// Amount received
        amount: Money,
        /// Gateway reference
        reference: String,
    },
    /// Payment attempt failed
    SegmentFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Segment ID
        segment_id: SegmentId,
        /// Failure reason
        reason: String,
    },
    /// Every required segment paid; booking confirmed
    BookingConfirmed {
        /// Booking ID
        booking_id: BookingId,
        /// When it was confirmed
        confirmed_at: DateTime<Utc>,
    },
    /// Hold lapsed before payment was initiated
    HoldExpired {
        /// Booking ID
        booking_id: BookingId,
        /// When it lapsed
        expired_at: DateTime<Utc>,
    },
    /// Booking cancelled
    BookingCancelled {
        /// Booking ID
        booking_id: BookingId,
        /// Who cancelled
        by: Actor,
        /// Status before cancellation
        from: BookingStatus,
        /// Reason
        reason: String,
        /// Fee retained
        fee: Money,
        /// Total being refunded
        refund_total: Money,
    },
    /// Booking rejected by an admin
    BookingRejected {
        /// Booking ID
        booking_id: BookingId,
        /// Reason
        reason: String,
    },
    /// Job offered to a worker
    WorkerOffered {
        /// Booking ID
        booking_id: BookingId,
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
        /// Acceptance deadline
        expires_at: DateTime<Utc>,
    },
    /// Worker accepted (or was force-assigned)
    AssignmentAccepted {
        /// Booking ID
        booking_id: BookingId,
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
        /// Admin override
        forced: bool,
    },
    /// Worker declined
    AssignmentRejected {
        /// Booking ID
        booking_id: BookingId,
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
        /// Reason
        reason: String,
    },
    /// Worker did not answer in time
    OfferTimedOut {
        /// Booking ID
        booking_id: BookingId,
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
    },
    /// Worker started the job
    AssignmentStarted {
        /// Booking ID
        booking_id: BookingId,
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
    },
    /// Worker could not finish
    AssignmentFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
        /// Reason
        reason: String,
    },
    /// Job completed with the customer's OTP
    BookingCompleted {
        /// Booking ID
        booking_id: BookingId,
        /// Worker ID
        worker_id: WorkerId,
        /// When it completed
        completed_at: DateTime<Utc>,
    },
    /// Dispatch exhausted the candidate pool
    BookingUnassignable {
        /// Booking ID
        booking_id: BookingId,
        /// Eligible candidates left untried
        remaining_candidates: usize,
    },
    /// Refund issued to the gateway
    RefundRequested {
        /// Booking ID
        booking_id: BookingId,
        /// Segment ID
        segment_id: SegmentId,
        /// Amount
        amount: Money,
    },
    /// Refund settled
    RefundIssued {
        /// Booking ID
        booking_id: BookingId,
        /// Segment ID
        segment_id: SegmentId,
        /// Amount
        amount: Money,
        /// Gateway refund reference
        reference: String,
    },
    /// Refund attempt failed; segment still paid
    RefundFailed {
        /// Booking ID
        booking_id: BookingId,
        /// Segment ID
        segment_id: SegmentId,
        /// Amount
        amount: Money,
        /// Reason
        reason: String,
    },
    /// Late-cancellation fee retained
    CancellationFeeCharged {
        /// Booking ID
        booking_id: BookingId,
        /// Fee
        amount: Money,
    },
    /// Admin annotated the booking
    AdminNoteAdded {
        /// Booking ID
        booking_id: BookingId,
        /// Author
        author: String,
    },
}

impl BookingEvent {
    /// Booking the event belongs to
    #[must_use]
    pub const fn booking_id(&self) -> BookingId {
        match self {
            Self::HoldPlaced { booking_id, .. }
            | Self::PaymentInitiated { booking_id, .. }
            | Self::SegmentPaid { booking_id, .. }
            | Self::SegmentFailed { booking_id, .. }
            | Self::BookingConfirmed { booking_id, .. }
            | Self::HoldExpired { booking_id, .. }
            | Self::BookingCancelled { booking_id, .. }
            | Self::BookingRejected { booking_id, .. }
            | Self::WorkerOffered { booking_id, .. }
            | Self::AssignmentAccepted { booking_id, .. }
            | Self::AssignmentRejected { booking_id, .. }
            | Self::OfferTimedOut { booking_id, .. }
            | Self::AssignmentStarted { booking_id, .. }
            | Self::AssignmentFailed { booking_id, .. }
            | Self::BookingCompleted { booking_id, .. }
            | Self::BookingUnassignable { booking_id, .. }
            | Self::RefundRequested { booking_id, .. }
            | Self::RefundIssued { booking_id, .. }
            | Self::RefundFailed { booking_id, .. }
            | Self::CancellationFeeCharged { booking_id, .. }
            | Self::AdminNoteAdded { booking_id, .. } => *booking_id,
        }
    }

    /// Event type name, used for logging and metrics labels
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HoldPlaced { .. } => "hold_placed",
            Self::PaymentInitiated { .. } => "payment_initiated",
            Self::SegmentPaid { .. } => "segment_paid",
            Self::SegmentFailed { .. } => "segment_failed",
            Self::BookingConfirmed { .. } => "booking_confirmed",
            Self::HoldExpired { .. } => "hold_expired",
            Self::BookingCancelled { .. } => "booking_cancelled",
            Self::BookingRejected { .. } => "booking_rejected",
            Self::WorkerOffered { .. } => "worker_offered",
            Self::AssignmentAccepted { .. } => "assignment_accepted",
            Self::AssignmentRejected { .. } => "assignment_rejected",
            Self::OfferTimedOut { .. } => "offer_timed_out",
            Self::AssignmentStarted { .. } => "assignment_started",
            Self::AssignmentFailed { .. } => "assignment_failed",
            Self::BookingCompleted { .. } => "booking_completed",
            Self::BookingUnassignable { .. } => "booking_unassignable",
            Self::RefundRequested { .. } => "refund_requested",
            Self::RefundIssued { .. } => "refund_issued",
            Self::RefundFailed { .. } => "refund_failed",
            Self::CancellationFeeCharged { .. } => "cancellation_fee_charged",
            Self::AdminNoteAdded { .. } => "admin_note_added",
        }
    }
}
