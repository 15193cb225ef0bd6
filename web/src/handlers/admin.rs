//! Admin endpoints.
//!
//! Manual overrides of dispatch plus the audited money operations. None of
//! them bypass the booking state machine: a forced assignment still honours
//! worker buffers, and a refund can never exceed what was paid.

use crate::error::AppError;
use crate::handlers::bookings::BookingView;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use booking_core::types::{Actor, BookingId, Money, SegmentId, WorkerId};
use serde::Deserialize;

/// Manual dispatch
#[derive(Debug, Default, Deserialize)]
pub struct AssignWorkerRequest {
    /// Worker to force; the pool picks when absent
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
}

/// Rejection or cancellation with a reason
#[derive(Debug, Deserialize)]
pub struct ReasonRequest {
    /// Why
    pub reason: String,
}

/// Manual refund
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Paid segment to refund
    pub segment_id: SegmentId,
    /// Partial amount in cents; everything refundable when absent
    #[serde(default)]
    pub amount: Option<Money>,
}

/// Admin note
#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    /// Who is writing
    pub author: String,
    /// Note text
    pub note: String,
}

/// Assign a worker, or rerun the pool.
///
/// `409 BUFFER_CONFLICT` when the forced worker is busy around the window,
/// `409 NO_AVAILABLE_WORKER` when the pool has nobody left.
pub async fn assign_worker(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    body: Option<Json<AssignWorkerRequest>>,
) -> Result<Json<BookingView>, AppError> {
    let worker_id = body.and_then(|Json(request)| request.worker_id);
    let booking = state.service.assign_worker(id, worker_id).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Reject a booking; paid money is refunded in full
pub async fn reject_booking(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.reject(id, request.reason).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Cancel on the customer's behalf; no cancellation fee is kept
pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.cancel(id, Actor::Admin, request.reason).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Refund a paid segment, or retry a refund the gateway refused
pub async fn refund_segment(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state
        .service
        .request_refund(id, request.segment_id, request.amount)
        .await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Append a note
pub async fn add_note(
    State(state): State<AppState>,
    Path(id): Path<BookingId>,
    Json(request): Json<NoteRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.add_note(id, request.author, request.note).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}
