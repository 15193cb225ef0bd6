//! Worker endpoints.
//!
//! The worker identifies themself in the body; an assignment offered to
//! someone else answers `403 NOT_ASSIGNED_WORKER`.

use crate::error::AppError;
use crate::handlers::bookings::BookingView;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use booking_core::types::{AssignmentId, Worker, WorkerId};
use serde::Deserialize;

/// Accept or start
#[derive(Debug, Deserialize)]
pub struct WorkerRequest {
    /// Acting worker
    pub worker_id: WorkerId,
}

/// Reject or fail
#[derive(Debug, Deserialize)]
pub struct WorkerReasonRequest {
    /// Acting worker
    pub worker_id: WorkerId,
    /// Why
    #[serde(default)]
    pub reason: Option<String>,
}

/// Complete
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    /// Acting worker
    pub worker_id: WorkerId,
    /// Completion code shown by the customer
    pub otp: String,
}

/// Availability toggle
#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    /// Whether the worker takes new jobs
    pub available: bool,
}

fn reason_or(reason: Option<String>, fallback: &str) -> String {
    reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Accept an offer; reserves the worker's padded window
pub async fn accept_assignment(
    State(state): State<AppState>,
    Path(id): Path<AssignmentId>,
    Json(request): Json<WorkerRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.accept_assignment(id, request.worker_id).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Decline an offer; dispatch moves to the next candidate
pub async fn reject_assignment(
    State(state): State<AppState>,
    Path(id): Path<AssignmentId>,
    Json(request): Json<WorkerReasonRequest>,
) -> Result<Json<BookingView>, AppError> {
    let reason = reason_or(request.reason, "declined by worker");
    let booking = state
        .service
        .reject_assignment(id, request.worker_id, reason)
        .await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Start work
pub async fn start_assignment(
    State(state): State<AppState>,
    Path(id): Path<AssignmentId>,
    Json(request): Json<WorkerRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state.service.start_assignment(id, request.worker_id).await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Finish work with the customer's completion code
pub async fn complete_assignment(
    State(state): State<AppState>,
    Path(id): Path<AssignmentId>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<BookingView>, AppError> {
    let booking = state
        .service
        .complete_assignment(id, request.worker_id, request.otp)
        .await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Give up after starting; the booking is dispatched again
pub async fn fail_assignment(
    State(state): State<AppState>,
    Path(id): Path<AssignmentId>,
    Json(request): Json<WorkerReasonRequest>,
) -> Result<Json<BookingView>, AppError> {
    let reason = reason_or(request.reason, "worker could not finish");
    let booking = state
        .service
        .fail_assignment(id, request.worker_id, reason)
        .await?;
    Ok(Json(BookingView::from_state(&booking)?))
}

/// Toggle availability for new offers
pub async fn set_availability(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<Worker>, AppError> {
    let worker = state.service.set_worker_availability(id, request.available).await?;
    Ok(Json(worker))
}
