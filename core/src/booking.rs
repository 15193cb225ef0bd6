//! Booking state machine.
//!
//! Lifecycle: `held → pending_payment → confirmed → assigned → in_progress →
//! completed`, with `rejected`, `cancelled` and `expired` as side branches.
//! The reducer owns the booking, its hold, its payment ledger and its worker
//! assignments. Each action is validated first; a guard failure records the
//! error in `last_error`, leaves the state alone and yields no effects.
//! Accepted actions mutate the state and describe storage, publish,
//! dispatch and refund effects for the runtime to execute.

use crate::assignment::{AssignmentStatus, WorkerAssignment};
use crate::buffer::BufferRequest;
use crate::config::BookingConfig;
use crate::effect::{DispatchRequest, Effect, RefundRequest, StorageOp};
use crate::environment::Clock;
use crate::error::{BookingError, BookingResult};
use crate::events::BookingEvent;
use crate::hold::{Hold, payment_expiry};
use crate::ledger::{SegmentLedger, SegmentSpec};
use crate::reducer::Reducer;
use crate::slot::SlotToken;
use crate::types::{
    Actor, Address, AdminNote, AreaId, AssignmentId, Booking, BookingId, BookingStatus, CustomerId, Money,
    PaymentMethod, SegmentId, Service, WorkerId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;

type Effects = SmallVec<[Effect<BookingAction>; 4]>;

// ============================================================================
// State
// ============================================================================

/// One booking with everything the state machine owns
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingState {
    /// The booking; `None` before `PlaceHold`
    pub booking: Option<Booking>,
    /// Phase-one reservation; cleared on promotion, expiry or cancellation
    pub hold: Option<Hold>,
    /// Payment segments and audit trail
    pub ledger: SegmentLedger,
    /// Every assignment ever made, oldest first
    pub assignments: Vec<WorkerAssignment>,
    /// Guard failure from the last action
    #[serde(skip)]
    pub last_error: Option<BookingError>,
}

impl BookingState {
    /// Empty state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Booking ID, if a booking exists
    #[must_use]
    pub fn id(&self) -> Option<BookingId> {
        self.booking.as_ref().map(|b| b.id)
    }

    /// Current status, if a booking exists
    #[must_use]
    pub fn status(&self) -> Option<BookingStatus> {
        self.booking.as_ref().map(|b| b.status)
    }

    /// The single non-terminal assignment, if any
    #[must_use]
    pub fn active_assignment(&self) -> Option<&WorkerAssignment> {
        self.assignments.iter().find(|a| a.status.is_active())
    }

    /// Looks an assignment up
    #[must_use]
    pub fn assignment(&self, id: AssignmentId) -> Option<&WorkerAssignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    /// Workers already offered this booking
    #[must_use]
    pub fn tried_workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self.assignments.iter().map(|a| a.worker_id).collect();
        workers.sort_unstable();
        workers.dedup();
        workers
    }

    /// Hold expiry while the booking still awaits payment
    #[must_use]
    pub fn hold_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.status(), &self.hold) {
            (Some(status), Some(hold)) if status.is_awaiting_payment() => Some(hold.expires_at),
            _ => None,
        }
    }

    /// Acceptance deadline of the pending offer
    #[must_use]
    pub fn offer_deadline(&self) -> Option<(AssignmentId, DateTime<Utc>)> {
        self.assignments
            .iter()
            .find(|a| a.status == AssignmentStatus::Offered)
            .and_then(|a| a.offer_expires_at.map(|deadline| (a.id, deadline)))
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Commands accepted by the booking state machine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BookingAction {
    /// Create the booking on a checked slot
    PlaceHold {
        /// New booking ID
        booking_id: BookingId,
        /// Customer
        customer_id: CustomerId,
        /// Service being booked
        service: Service,
        /// Service area
        area_id: AreaId,
        /// Job address
        address: Address,
        /// Slot proof from the allocator
        slot: SlotToken,
        /// Worker to try first
        preferred_worker: Option<WorkerId>,
        /// Payment plan; empty means one full segment
        segments: Vec<SegmentSpec>,
        /// Completion code
        otp: String,
    },
    /// Customer started paying
    InitiatePayment {
        /// Payment method
        method: PaymentMethod,
    },
    /// A segment payment cleared
    PaySegment {
        /// Segment ID
        segment_id: SegmentId,
        /// Amount received
        amount: Money,
        /// Gateway payment reference (idempotency key)
        reference: String,
    },
    /// A segment payment attempt failed
    FailSegment {
        /// Segment ID
        segment_id: SegmentId,
        /// Failure reason
        reason: String,
        /// Gateway reference, if the failure came from a webhook
        reference: Option<String>,
    },
    /// Sweep: release the slot if the hold has lapsed
    ExpireHold,
    /// Cancel the booking
    Cancel {
        /// Who is cancelling
        by: Actor,
        /// Reason
        reason: String,
    },
    /// Admin rejection
    Reject {
        /// Reason
        reason: String,
    },
    /// Offer the job to a worker chosen by the pool
    OfferWorker {
        /// New assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
    },
    /// Worker accepts an offer
    AcceptAssignment {
        /// Assignment ID
        assignment_id: AssignmentId,
    },
    /// Worker declines an offer (or backs out before starting)
    RejectAssignment {
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Reason
        reason: String,
    },
    /// Sweep: time out an unanswered offer
    ExpireOffer {
        /// Assignment ID
        assignment_id: AssignmentId,
    },
    /// Worker arrives and starts
    StartAssignment {
        /// Assignment ID
        assignment_id: AssignmentId,
    },
    /// Worker finishes, proving presence with the OTP
    CompleteAssignment {
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Code from the customer
        otp: String,
    },
    /// Worker cannot finish
    FailAssignment {
        /// Assignment ID
        assignment_id: AssignmentId,
        /// Reason
        reason: String,
    },
    /// Admin override of the pool
    ForceAssign {
        /// New assignment ID
        assignment_id: AssignmentId,
        /// Worker ID
        worker_id: WorkerId,
    },
    /// Pool found nobody
    MarkUnassignable {
        /// Eligible candidates left untried
        remaining_candidates: usize,
    },
    /// Admin refund of a paid segment
    RequestRefund {
        /// Segment ID
        segment_id: SegmentId,
        /// Amount; defaults to everything refundable
        amount: Option<Money>,
    },
    /// Gateway confirmed a refund
    RefundSucceeded {
        /// Segment ID
        segment_id: SegmentId,
        /// Amount
        amount: Money,
        /// Gateway refund reference
        refund_reference: String,
    },
    /// Gateway refused a refund
    RefundFailed {
        /// Segment ID
        segment_id: SegmentId,
        /// Amount
        amount: Money,
        /// Reason
        reason: String,
    },
    /// Admin annotation
    AddAdminNote {
        /// Author
        author: String,
        /// Note text
        note: String,
    },
}

impl BookingAction {
    /// Action name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PlaceHold { .. } => "place_hold",
            Self::InitiatePayment { .. } => "initiate_payment",
            Self::PaySegment { .. } => "pay_segment",
            Self::FailSegment { .. } => "fail_segment",
            Self::ExpireHold => "expire_hold",
            Self::Cancel { .. } => "cancel",
            Self::Reject { .. } => "reject",
            Self::OfferWorker { .. } => "offer_worker",
            Self::AcceptAssignment { .. } => "accept_assignment",
            Self::RejectAssignment { .. } => "reject_assignment",
            Self::ExpireOffer { .. } => "expire_offer",
            Self::StartAssignment { .. } => "start_assignment",
            Self::CompleteAssignment { .. } => "complete_assignment",
            Self::FailAssignment { .. } => "fail_assignment",
            Self::ForceAssign { .. } => "force_assign",
            Self::MarkUnassignable { .. } => "mark_unassignable",
            Self::RequestRefund { .. } => "request_refund",
            Self::RefundSucceeded { .. } => "refund_succeeded",
            Self::RefundFailed { .. } => "refund_failed",
            Self::AddAdminNote { .. } => "add_admin_note",
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the booking reducer
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for timestamps and expiry checks
    pub clock: Arc<dyn Clock>,
    /// Configuration snapshot for this operation
    pub config: Arc<BookingConfig>,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: Arc<BookingConfig>) -> Self {
        Self { clock, config }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the booking state machine
#[derive(Clone, Copy, Debug, Default)]
pub struct BookingReducer;

impl BookingReducer {
    /// Creates a new `BookingReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    #[allow(clippy::too_many_lines)]
    fn handle(state: &mut BookingState, action: BookingAction, env: &BookingEnvironment) -> BookingResult<Effects> {
        let now = env.clock.now();
        let config = env.config.as_ref();

        match action {
            BookingAction::PlaceHold {
                booking_id,
                customer_id,
                service,
                area_id,
                address,
                slot,
                preferred_worker,
                segments,
                otp,
            } => {
                if let Some(status) = state.status() {
                    return Err(BookingError::transition(status, "place hold"));
                }
                if !service.active {
                    return Err(BookingError::invalid(format!("service {} is not bookable", service.id)));
                }
                if otp.is_empty() {
                    return Err(BookingError::invalid("completion code is required"));
                }
                let ledger = SegmentLedger::plan(service.price, &segments)?;
                let hold = Hold::place(booking_id, slot.key, slot.claim, now, config);

                state.booking = Some(Booking {
                    id: booking_id,
                    customer_id,
                    service_id: service.id,
                    area_id,
                    address,
                    window: slot.window,
                    slot: slot.key,
                    status: BookingStatus::Held,
                    total_price: service.price,
                    payment_status: ledger.payment_status(),
                    payment_method: None,
                    worker_id: None,
                    preferred_worker: preferred_worker.or_else(|| slot.key.worker()),
                    otp,
                    admin_notes: Vec::new(),
                    unassignable: false,
                    cancellation_fee: None,
                    closing_reason: None,
                    created_at: now,
                    updated_at: now,
                });
                state.hold = Some(hold);
                state.ledger = ledger;
                state.assignments.clear();

                Ok(smallvec![Effect::Publish(BookingEvent::HoldPlaced {
                    booking_id,
                    window: slot.window,
                    expires_at: hold.expires_at,
                })])
            },

            BookingAction::InitiatePayment { method } => {
                let booking = require(state)?;
                if !booking.status.is_awaiting_payment() {
                    return Err(BookingError::transition(booking.status, "initiate payment"));
                }
                let booking_id = booking.id;
                let hold = state
                    .hold
                    .as_mut()
                    .ok_or_else(|| BookingError::transition("no hold", "initiate payment"))?;
                if hold.is_expired(now) {
                    return Err(BookingError::HoldExpired {
                        booking_id,
                        expired_at: hold.expires_at,
                    });
                }

                let expires_at = payment_expiry(method, now, config).max(hold.expires_at);
                hold.expires_at = expires_at;
                let booking = require_mut(state)?;
                booking.status = BookingStatus::PendingPayment;
                booking.payment_method = Some(method);
                booking.updated_at = now;

                Ok(smallvec![
                    Effect::Storage(StorageOp::ExtendHold { expires_at }),
                    Effect::Publish(BookingEvent::PaymentInitiated {
                        booking_id,
                        method,
                        expires_at,
                    }),
                ])
            },

            BookingAction::PaySegment {
                segment_id,
                amount,
                reference,
            } => {
                let booking = require(state)?;
                let (booking_id, status) = (booking.id, booking.status);
                state.ledger.check_payment(segment_id, amount, &reference)?;

                if status.is_awaiting_payment() && state.hold.is_some_and(|h| h.is_expired(now)) {
                    // Expire first so the payment takes the late path below.
                    return Ok(smallvec![
                        Effect::Send(Box::new(BookingAction::ExpireHold)),
                        Effect::Send(Box::new(BookingAction::PaySegment {
                            segment_id,
                            amount,
                            reference,
                        })),
                    ]);
                }

                let outcome = state.ledger.pay(segment_id, amount, &reference, now)?;
                let mut effects: Effects = smallvec![Effect::Publish(BookingEvent::SegmentPaid {
                    booking_id,
                    segment_id,
                    amount,
                    reference: reference.clone(),
                })];

                match status {
                    BookingStatus::Held | BookingStatus::PendingPayment => {
                        let booking = require_mut(state)?;
                        booking.status = BookingStatus::PendingPayment;
                        if booking.payment_method.is_none() {
                            booking.payment_method = Some(PaymentMethod::Gateway);
                        }
                        if outcome.newly_funded {
                            effects.extend(confirm(state, now, config)?);
                        }
                    },
                    BookingStatus::Expired | BookingStatus::Cancelled | BookingStatus::Rejected => {
                        let refund = RefundRequest {
                            booking_id,
                            segment_id,
                            amount,
                            payment_reference: reference,
                        };
                        effects.push(Effect::Publish(BookingEvent::RefundRequested {
                            booking_id,
                            segment_id,
                            amount,
                        }));
                        effects.push(Effect::Refund(refund));
                    },
                    BookingStatus::Confirmed
                    | BookingStatus::Assigned
                    | BookingStatus::InProgress
                    | BookingStatus::Completed => {},
                }

                sync_payment_status(state, now);
                Ok(effects)
            },

            BookingAction::FailSegment {
                segment_id,
                reason,
                reference,
            } => {
                let booking_id = require(state)?.id;
                let changed = state.ledger.fail(segment_id, &reason, reference.as_deref(), now)?;
                if !changed {
                    return Ok(SmallVec::new());
                }
                sync_payment_status(state, now);
                Ok(smallvec![Effect::Publish(BookingEvent::SegmentFailed {
                    booking_id,
                    segment_id,
                    reason,
                })])
            },

            BookingAction::ExpireHold => {
                let booking = require(state)?;
                let (booking_id, from) = (booking.id, booking.status);
                let lapsed = from.is_awaiting_payment() && state.hold.is_some_and(|h| h.is_expired(now));
                if !lapsed {
                    // Already advanced or not yet due.
                    return Ok(SmallVec::new());
                }

                let refunds = state.ledger.refund_plan(booking_id, Money::ZERO);
                let refund_total: Money = refunds.iter().map(|r| r.amount).sum();
                state.hold = None;

                let booking = require_mut(state)?;
                booking.updated_at = now;
                let mut effects: Effects = smallvec![Effect::Storage(StorageOp::ReleaseClaim)];
                if from == BookingStatus::Held {
                    booking.status = BookingStatus::Expired;
                    effects.push(Effect::Publish(BookingEvent::HoldExpired {
                        booking_id,
                        expired_at: now,
                    }));
                } else {
                    booking.status = BookingStatus::Cancelled;
                    booking.closing_reason = Some("payment timed out".to_string());
                    effects.push(Effect::Publish(BookingEvent::BookingCancelled {
                        booking_id,
                        by: Actor::System,
                        from,
                        reason: "payment timed out".to_string(),
                        fee: Money::ZERO,
                        refund_total,
                    }));
                }
                effects.extend(refund_effects(refunds));
                Ok(effects)
            },

            BookingAction::Cancel { by, reason } => {
                let booking = require(state)?;
                if booking.status.is_terminal() {
                    return Err(BookingError::transition(booking.status, "cancel"));
                }
                let (booking_id, from) = (booking.id, booking.status);
                let late = booking.window.start - now <= config.cancellation_cutoff();
                let fee = if late && by == Actor::Customer {
                    booking
                        .total_price
                        .percent(config.booking_cancellation_fee_percent)
                        .min(state.ledger.net_paid())
                } else {
                    Money::ZERO
                };

                let refunds = state.ledger.refund_plan(booking_id, fee);
                let refund_total: Money = refunds.iter().map(|r| r.amount).sum();
                if !fee.is_zero() {
                    state.ledger.charge_fee(fee, now);
                }
                let mut effects = close(state, BookingStatus::Cancelled, &reason, now)?;
                let booking = require_mut(state)?;
                booking.cancellation_fee = (!fee.is_zero()).then_some(fee);

                effects.push(Effect::Publish(BookingEvent::BookingCancelled {
                    booking_id,
                    by,
                    from,
                    reason,
                    fee,
                    refund_total,
                }));
                if !fee.is_zero() {
                    effects.push(Effect::Publish(BookingEvent::CancellationFeeCharged {
                        booking_id,
                        amount: fee,
                    }));
                }
                effects.extend(refund_effects(refunds));
                sync_payment_status(state, now);
                Ok(effects)
            },

            BookingAction::Reject { reason } => {
                let booking = require(state)?;
                if booking.status.is_terminal() {
                    return Err(BookingError::transition(booking.status, "reject"));
                }
                let booking_id = booking.id;
                let refunds = state.ledger.refund_plan(booking_id, Money::ZERO);
                let mut effects = close(state, BookingStatus::Rejected, &reason, now)?;
                effects.push(Effect::Publish(BookingEvent::BookingRejected { booking_id, reason }));
                effects.extend(refund_effects(refunds));
                Ok(effects)
            },

            BookingAction::OfferWorker {
                assignment_id,
                worker_id,
            } => {
                let booking = require(state)?;
                if booking.status != BookingStatus::Confirmed {
                    return Err(BookingError::transition(booking.status, "offer worker"));
                }
                let booking_id = booking.id;
                if state.active_assignment().is_some() {
                    return Err(BookingError::transition("an assignment is active", "offer worker"));
                }
                if state.assignments.iter().any(|a| a.worker_id == worker_id) {
                    return Err(BookingError::transition("worker was already offered", "offer worker"));
                }

                let expires_at = now + config.acceptance_timeout();
                state
                    .assignments
                    .push(WorkerAssignment::offer(assignment_id, booking_id, worker_id, now, expires_at));
                let booking = require_mut(state)?;
                booking.unassignable = false;
                booking.updated_at = now;

                Ok(smallvec![Effect::Publish(BookingEvent::WorkerOffered {
                    booking_id,
                    assignment_id,
                    worker_id,
                    expires_at,
                })])
            },

            BookingAction::AcceptAssignment { assignment_id } => {
                let index = assignment_index(state, assignment_id)?;
                if !state.assignments[index].can_accept(now)? {
                    return Ok(SmallVec::new());
                }
                let booking = require(state)?;
                if booking.status != BookingStatus::Confirmed {
                    return Err(BookingError::transition(booking.status, "accept assignment"));
                }
                let (booking_id, window) = (booking.id, booking.window);

                let assignment = &mut state.assignments[index];
                assignment.transition(AssignmentStatus::Accepted, now, None);
                let worker_id = assignment.worker_id;
                assign(state, worker_id, now)?;

                Ok(smallvec![
                    Effect::Storage(StorageOp::ReserveBuffer(BufferRequest {
                        worker_id,
                        booking_id,
                        assignment_id,
                        window,
                        buffer_minutes: config.booking_buffer_time_minutes,
                    })),
                    Effect::Publish(BookingEvent::AssignmentAccepted {
                        booking_id,
                        assignment_id,
                        worker_id,
                        forced: false,
                    }),
                ])
            },

            BookingAction::RejectAssignment { assignment_id, reason } => {
                let index = assignment_index(state, assignment_id)?;
                state.assignments[index].can_reject()?;
                let booking_id = require(state)?.id;

                let assignment = &mut state.assignments[index];
                let held_buffer = assignment.status.holds_buffer();
                assignment.transition(AssignmentStatus::Rejected, now, Some(reason.clone()));
                let worker_id = assignment.worker_id;

                let mut effects: Effects = SmallVec::new();
                if held_buffer {
                    effects.push(Effect::Storage(StorageOp::ReleaseBuffer { worker_id }));
                    unassign(state, now)?;
                }
                effects.push(Effect::Publish(BookingEvent::AssignmentRejected {
                    booking_id,
                    assignment_id,
                    worker_id,
                    reason,
                }));
                effects.extend(redispatch(state));
                Ok(effects)
            },

            BookingAction::ExpireOffer { assignment_id } => {
                let index = assignment_index(state, assignment_id)?;
                if !state.assignments[index].offer_lapsed(now) {
                    return Ok(SmallVec::new());
                }
                let booking_id = require(state)?.id;
                let assignment = &mut state.assignments[index];
                assignment.transition(AssignmentStatus::TimedOut, now, Some("offer timed out".to_string()));
                let worker_id = assignment.worker_id;

                let mut effects: Effects = smallvec![Effect::Publish(BookingEvent::OfferTimedOut {
                    booking_id,
                    assignment_id,
                    worker_id,
                })];
                effects.extend(redispatch(state));
                Ok(effects)
            },

            BookingAction::StartAssignment { assignment_id } => {
                let index = assignment_index(state, assignment_id)?;
                if !state.assignments[index].can_start()? {
                    return Ok(SmallVec::new());
                }
                let booking = require(state)?;
                if booking.status != BookingStatus::Assigned {
                    return Err(BookingError::transition(booking.status, "start assignment"));
                }
                let booking_id = booking.id;

                let assignment = &mut state.assignments[index];
                assignment.transition(AssignmentStatus::Started, now, None);
                let worker_id = assignment.worker_id;
                let booking = require_mut(state)?;
                booking.status = BookingStatus::InProgress;
                booking.updated_at = now;

                Ok(smallvec![Effect::Publish(BookingEvent::AssignmentStarted {
                    booking_id,
                    assignment_id,
                    worker_id,
                })])
            },

            BookingAction::CompleteAssignment { assignment_id, otp } => {
                let index = assignment_index(state, assignment_id)?;
                if !state.assignments[index].can_complete()? {
                    return Ok(SmallVec::new());
                }
                let booking = require(state)?;
                if booking.otp != otp {
                    return Err(BookingError::InvalidOtp);
                }
                let booking_id = booking.id;

                let assignment = &mut state.assignments[index];
                assignment.transition(AssignmentStatus::Completed, now, None);
                let worker_id = assignment.worker_id;
                let booking = require_mut(state)?;
                booking.status = BookingStatus::Completed;
                booking.updated_at = now;

                Ok(smallvec![
                    Effect::Storage(StorageOp::ReleaseBuffer { worker_id }),
                    Effect::Storage(StorageOp::ReleaseClaim),
                    Effect::Publish(BookingEvent::BookingCompleted {
                        booking_id,
                        worker_id,
                        completed_at: now,
                    }),
                ])
            },

            BookingAction::FailAssignment { assignment_id, reason } => {
                let index = assignment_index(state, assignment_id)?;
                state.assignments[index].can_fail()?;
                let booking_id = require(state)?.id;

                let assignment = &mut state.assignments[index];
                assignment.transition(AssignmentStatus::Failed, now, Some(reason.clone()));
                let worker_id = assignment.worker_id;
                unassign(state, now)?;

                let mut effects: Effects = smallvec![
                    Effect::Storage(StorageOp::ReleaseBuffer { worker_id }),
                    Effect::Publish(BookingEvent::AssignmentFailed {
                        booking_id,
                        assignment_id,
                        worker_id,
                        reason,
                    }),
                ];
                effects.extend(redispatch(state));
                Ok(effects)
            },

            BookingAction::ForceAssign {
                assignment_id,
                worker_id,
            } => {
                let booking = require(state)?;
                if !matches!(booking.status, BookingStatus::Confirmed | BookingStatus::Assigned) {
                    return Err(BookingError::transition(booking.status, "assign worker"));
                }
                let (booking_id, window) = (booking.id, booking.window);

                let mut effects = withdraw_active(state, now, "reassigned by admin");
                state
                    .assignments
                    .push(WorkerAssignment::forced(assignment_id, booking_id, worker_id, now));
                assign(state, worker_id, now)?;

                effects.push(Effect::Storage(StorageOp::ReserveBuffer(BufferRequest {
                    worker_id,
                    booking_id,
                    assignment_id,
                    window,
                    buffer_minutes: config.booking_buffer_time_minutes,
                })));
                effects.push(Effect::Publish(BookingEvent::AssignmentAccepted {
                    booking_id,
                    assignment_id,
                    worker_id,
                    forced: true,
                }));
                Ok(effects)
            },

            BookingAction::MarkUnassignable { remaining_candidates } => {
                let booking = require(state)?;
                if booking.status != BookingStatus::Confirmed || state.active_assignment().is_some() {
                    // Staffed or closed in the meantime.
                    return Ok(SmallVec::new());
                }
                let booking_id = booking.id;
                let booking = require_mut(state)?;
                booking.unassignable = true;
                booking.updated_at = now;
                Ok(smallvec![Effect::Publish(BookingEvent::BookingUnassignable {
                    booking_id,
                    remaining_candidates,
                })])
            },

            BookingAction::RequestRefund { segment_id, amount } => {
                let booking_id = require(state)?.id;
                let refund = state.ledger.refund_request(booking_id, segment_id, amount)?;
                Ok(refund_effects(vec![refund]))
            },

            BookingAction::RefundSucceeded {
                segment_id,
                amount,
                refund_reference,
            } => {
                let booking_id = require(state)?.id;
                if !state.ledger.record_refund(segment_id, amount, &refund_reference, now)? {
                    return Ok(SmallVec::new());
                }
                sync_payment_status(state, now);
                Ok(smallvec![Effect::Publish(BookingEvent::RefundIssued {
                    booking_id,
                    segment_id,
                    amount,
                    reference: refund_reference,
                })])
            },

            BookingAction::RefundFailed {
                segment_id,
                amount,
                reason,
            } => {
                let booking_id = require(state)?.id;
                state.ledger.record_refund_failure(segment_id, amount, &reason, now)?;
                Ok(smallvec![Effect::Publish(BookingEvent::RefundFailed {
                    booking_id,
                    segment_id,
                    amount,
                    reason,
                })])
            },

            BookingAction::AddAdminNote { author, note } => {
                if note.trim().is_empty() {
                    return Err(BookingError::invalid("note must not be empty"));
                }
                let booking = require_mut(state)?;
                booking.admin_notes.push(AdminNote {
                    author: author.clone(),
                    note,
                    at: now,
                });
                booking.updated_at = now;
                Ok(smallvec![Effect::Publish(BookingEvent::AdminNoteAdded {
                    booking_id: booking.id,
                    author,
                })])
            },
        }
    }
}

impl Reducer for BookingReducer {
    type State = BookingState;
    type Action = BookingAction;
    type Environment = BookingEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        let name = action.name();
        state.last_error = None;
        match Self::handle(state, action, env) {
            Ok(effects) => effects,
            Err(error) => {
                tracing::debug!(action = name, code = error.code(), %error, "booking action refused");
                state.last_error = Some(error);
                SmallVec::new()
            },
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn require(state: &BookingState) -> BookingResult<&Booking> {
    state
        .booking
        .as_ref()
        .ok_or_else(|| BookingError::not_found("booking", "(empty state)"))
}

fn require_mut(state: &mut BookingState) -> BookingResult<&mut Booking> {
    state
        .booking
        .as_mut()
        .ok_or_else(|| BookingError::not_found("booking", "(empty state)"))
}

fn assignment_index(state: &BookingState, id: AssignmentId) -> BookingResult<usize> {
    state
        .assignments
        .iter()
        .position(|a| a.id == id)
        .ok_or_else(|| BookingError::not_found("assignment", id))
}

fn sync_payment_status(state: &mut BookingState, now: DateTime<Utc>) {
    let status = state.ledger.payment_status();
    if let Some(booking) = state.booking.as_mut() {
        booking.payment_status = status;
        booking.updated_at = now;
    }
}

/// Fully funded: promote the hold and dispatch if configured
fn confirm(state: &mut BookingState, now: DateTime<Utc>, config: &BookingConfig) -> BookingResult<Effects> {
    state.hold = None;
    let booking = require_mut(state)?;
    booking.status = BookingStatus::Confirmed;
    booking.updated_at = now;
    let booking_id = booking.id;

    let mut effects: Effects = smallvec![
        Effect::Storage(StorageOp::PromoteHold),
        Effect::Publish(BookingEvent::BookingConfirmed {
            booking_id,
            confirmed_at: now,
        }),
    ];
    if config.auto_assign_workers_on_booking {
        effects.extend(redispatch(state));
    }
    Ok(effects)
}

/// Next dispatch request while the booking is confirmed and unstaffed
fn redispatch(state: &BookingState) -> Option<Effect<BookingAction>> {
    let booking = state.booking.as_ref()?;
    if booking.status != BookingStatus::Confirmed || state.active_assignment().is_some() {
        return None;
    }
    Some(Effect::Dispatch(DispatchRequest {
        booking_id: booking.id,
        service_id: booking.service_id,
        area_id: booking.area_id,
        window: booking.window,
        preferred_worker: booking.preferred_worker,
        excluded: state.tried_workers(),
    }))
}

fn assign(state: &mut BookingState, worker_id: WorkerId, now: DateTime<Utc>) -> BookingResult<()> {
    let booking = require_mut(state)?;
    booking.status = BookingStatus::Assigned;
    booking.worker_id = Some(worker_id);
    booking.unassignable = false;
    booking.updated_at = now;
    Ok(())
}

fn unassign(state: &mut BookingState, now: DateTime<Utc>) -> BookingResult<()> {
    let booking = require_mut(state)?;
    booking.status = BookingStatus::Confirmed;
    booking.worker_id = None;
    booking.updated_at = now;
    Ok(())
}

/// Cancels the active assignment, releasing its buffer if it held one
fn withdraw_active(state: &mut BookingState, now: DateTime<Utc>, reason: &str) -> Effects {
    let mut effects = Effects::new();
    for assignment in state.assignments.iter_mut().filter(|a| a.status.is_active()) {
        if assignment.status.holds_buffer() {
            effects.push(Effect::Storage(StorageOp::ReleaseBuffer {
                worker_id: assignment.worker_id,
            }));
        }
        assignment.transition(AssignmentStatus::Cancelled, now, Some(reason.to_string()));
    }
    effects
}

/// Moves to a terminal closing status, releasing claim and buffers
fn close(state: &mut BookingState, status: BookingStatus, reason: &str, now: DateTime<Utc>) -> BookingResult<Effects> {
    let mut effects: Effects = smallvec![Effect::Storage(StorageOp::ReleaseClaim)];
    effects.extend(withdraw_active(state, now, reason));
    state.hold = None;
    let booking = require_mut(state)?;
    booking.status = status;
    booking.closing_reason = Some(reason.to_string());
    booking.updated_at = now;
    Ok(effects)
}

fn refund_effects(refunds: Vec<RefundRequest>) -> Effects {
    let mut effects = Effects::new();
    for refund in refunds {
        effects.push(Effect::Publish(BookingEvent::RefundRequested {
            booking_id: refund.booking_id,
            segment_id: refund.segment_id,
            amount: refund.amount,
        }));
        effects.push(Effect::Refund(refund));
    }
    effects
}
