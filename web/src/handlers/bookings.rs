//! Customer booking endpoints.
//!
//! - `POST /bookings` - place a hold
//! - `POST /bookings/with-payment` - place a hold and collect the first segment
//! - `POST /bookings/verify-payment` - payment gateway callback
//! - `GET /bookings/:id` - booking details
//! - `PUT /bookings/:id/cancel` - customer cancellation
//! - `POST /bookings/:id/payment/initiate` - start paying
//! - `POST /bookings/:id/payment-segments/pay` - pay one segment
//!
//! # Flow
//!
//! ```text
//! held ──initiate──▶ pending_payment ──pay last required segment──▶ confirmed
//!   │                      │
//!   └──── hold lapses ─────┴──▶ expired / cancelled (slot released)
//! ```

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use booking_core::assignment::WorkerAssignment;
use booking_core::booking::BookingState;
use booking_core::ledger::PaymentSegment;
use booking_core::types::{
    Actor, AdminNote, Address, AreaId, BookingId, BookingStatus, CustomerId, Money, PaymentMethod, PaymentStatus,
    SegmentId, ServiceId, TimeWindow, WorkerId,
};
use booking_runtime::service::{HoldRequest, PaymentOutcome, PaymentWebhook};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Views
// ============================================================================

/// Booking as returned over HTTP
#[derive(Debug, Serialize)]
pub struct BookingView {
    /// Booking ID
    pub id: BookingId,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Customer
    pub customer_id: CustomerId,
    /// Booked service
    pub service_id: ServiceId,
    /// Service area
    pub area_id: AreaId,
    /// Job address
    pub address: Address,
    /// Service window
    pub window: TimeWindow,
    /// Slot the claim is held against
    pub slot: String,
    /// Total price in cents
    pub total_price: Money,
    /// Aggregate payment status
    pub payment_status: PaymentStatus,
    /// Chosen payment method
    pub payment_method: Option<PaymentMethod>,
    /// When an unpaid hold lapses
    pub hold_expires_at: Option<DateTime<Utc>>,
    /// Payment plan
    pub segments: Vec<PaymentSegment>,
    /// Assigned worker
    pub worker_id: Option<WorkerId>,
    /// Worker the customer asked for
    pub preferred_worker: Option<WorkerId>,
    /// Offer or assignment in progress
    pub active_assignment: Option<WorkerAssignment>,
    /// Dispatch ran out of candidates
    pub unassignable: bool,
    /// Fee kept on late cancellation
    pub cancellation_fee: Option<Money>,
    /// Reason recorded on rejection or cancellation
    pub closing_reason: Option<String>,
    /// Admin annotations
    pub admin_notes: Vec<AdminNote>,
    /// Completion code; only returned to the customer who booked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

impl BookingView {
    /// View with the completion code withheld
    ///
    /// # Errors
    ///
    /// Returns an internal error for a state without a booking.
    pub fn from_state(state: &BookingState) -> Result<Self, AppError> {
        let booking = state
            .booking
            .as_ref()
            .ok_or_else(|| AppError::internal("booking state is empty"))?;
        Ok(Self {
            id: booking.id,
            status: booking.status,
            customer_id: booking.customer_id,
            service_id: booking.service_id,
            area_id: booking.area_id,
            address: booking.address.clone(),
            window: booking.window,
            slot: booking.slot.to_string(),
            total_price: booking.total_price,
            payment_status: booking.payment_status,
            payment_method: booking.payment_method,
            hold_expires_at: state.hold_deadline(),
            segments: state.ledger.segments.clone(),
            worker_id: booking.worker_id,
            preferred_worker: booking.preferred_worker,
            active_assignment: state.active_assignment().cloned(),
            unassignable: booking.unassignable,
            cancellation_fee: booking.cancellation_fee,
            closing_reason: booking.closing_reason.clone(),
            admin_notes: booking.admin_notes.clone(),
            otp: None,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        })
    }

    /// View including the completion code, for the booking customer
    ///
    /// # Errors
    ///
    /// Returns an internal error for a state without a booking.
    pub fn with_otp(state: &BookingState) -> Result<Self, AppError> {
        let mut view = Self::from_state(state)?;
        view.otp = state.booking.as_ref().map(|b| b.otp.clone());
        Ok(view)
    }
}

/// Result of a payment call
#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    /// Booking after the payment
    pub booking: BookingView,
    /// Reference had already been processed
    pub duplicate: bool,
    /// Booking had closed; the money is being refunded
    pub late_payment: bool,
}

impl PaymentResponse {
    fn from_outcome(outcome: &PaymentOutcome, view: fn(&BookingState) -> Result<BookingView, AppError>) -> Result<Self, AppError> {
        Ok(Self {
            booking: view(&outcome.state)?,
            duplicate: outcome.duplicate,
            late_payment: outcome.late_payment,
        })
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Hold plus the method used to collect the first segment
#[derive(Debug, Deserialize)]
pub struct CreateWithPaymentRequest {
    /// The hold
    #[serde(flatten)]
    pub hold: HoldRequest,
    /// Payment method for the first segment
    pub payment_method: PaymentMethod,
}

/// Customer cancellation
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    /// Optional reason
    #[serde(default)]
    pub reason: Option<String>,
}

/// Start paying
#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    /// Payment method
    pub method: PaymentMethod,
}

/// Pay one segment
#[derive(Debug, Deserialize)]
pub struct PaySegmentRequest {
    /// Segment to pay
    pub segment_id: SegmentId,
    /// Amount in cents
    pub amount: Money,
    /// Gateway or wallet reference, the idempotency key
    pub reference: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Place a hold.
///
/// ```bash
/// curl -X POST http://localhost:8080/bookings \
///   -H "Content-Type: application/json" \
///   -d '{"customer_id":"...","service_id":"...","area_id":"...",
///        "start":"2025-01-07T10:00:00Z","address":{"line":"4 Quay Street"}}'
/// ```
///
/// Responds `201` with the held booking, its hold expiry and the completion
/// code; `409 SLOT_CONFLICT` when the window is taken.
pub async fn create_booking(
    State(state): State<AppState>,
    Json(request): Json<HoldRequest>,
) -> Result<(StatusCode, Json<BookingView>), AppError> {
    let held = state.service.place_hold(request).await?;
    Ok((StatusCode::CREATED, Json(BookingView::with_otp(&held)?)))
}

/// Place a hold and charge the first segment straight away.
///
/// A declined charge answers `402`; the hold stays pending and the segment
/// can be paid again before it lapses.
pub async fn create_booking_with_payment(
    State(state): State<AppState>,
    Json(request): Json<CreateWithPaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), AppError> {
    let outcome = state
        .service
        .place_hold_with_payment(request.hold, request.payment_method)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PaymentResponse::from_outcome(&outcome, BookingView::with_otp)?),
    ))
}

/// Payment gateway callback.
///
/// Idempotent on the payment reference: a replay answers `200` with
/// `duplicate: true` and changes nothing.
pub async fn verify_payment(
    State(state): State<AppState>,
    Json(webhook): Json<PaymentWebhook>,
) -> Result<Json<PaymentResponse>, AppError> {
    if webhook.reference.trim().is_empty() {
        return Err(AppError::bad_request("payment reference is required"));
    }
    let outcome = state.service.verify_payment(webhook).await?;
    Ok(Json(PaymentResponse::from_outcome(&outcome, BookingView::from_state)?))
}

/// Booking details, completion code withheld
pub async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.get(id).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Customer cancellation.
///
/// Before the cancellation cutoff everything paid is refunded; after it the
/// cancellation fee is kept.
pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<BookingView>, AppError> {
    let reason = body
        .and_then(|Json(request)| request.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled by customer".to_string());
    let booking = state.service.cancel(id, Actor::Customer, reason).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Start paying; extends the hold per payment method
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.initiate_payment(id, request.method).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Pay one segment
pub async fn pay_segment(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    Json(request): Json<PaySegmentRequest>,
) -> Result<Json<PaymentResponse>, AppError> {
    if request.reference.trim().is_empty() {
        return Err(AppError::bad_request("payment reference is required"));
    }
    let outcome = state
        .service
        .pay_segment(id, request.segment_id, request.amount, request.reference)
        .await?;
    Ok(Json(PaymentResponse::from_outcome(&outcome, BookingView::from_state)?))
}
