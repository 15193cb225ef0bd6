//! Router assembly.

use crate::handlers::{admin, bookings, health, workers};
use crate::middleware::correlation_id_layer;
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post, put},
};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Customer booking routes
fn booking_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(bookings::create_booking))
        .route("/with-payment", post(bookings::create_booking_with_payment))
        .route("/verify-payment", post(bookings::verify_payment))
        .route("/:id", get(bookings::get_booking))
        .route("/:id/cancel", put(bookings::cancel_booking))
        .route("/:id/payment/initiate", post(bookings::initiate_payment))
        .route("/:id/payment-segments/pay", post(bookings::pay_segment))
}

/// Admin overrides
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/bookings/:id/assign-worker", post(admin::assign_worker))
        .route("/bookings/:id/reject", post(admin::reject_booking))
        .route("/bookings/:id/cancel", put(admin::cancel_booking))
        .route("/bookings/:id/refund", post(admin::refund_segment))
        .route("/bookings/:id/notes", post(admin::add_note))
}

/// Worker lifecycle
fn worker_routes() -> Router<AppState> {
    Router::new()
        .route("/assignments/:id/accept", post(workers::accept_assignment))
        .route("/assignments/:id/reject", post(workers::reject_assignment))
        .route("/assignments/:id/start", post(workers::start_assignment))
        .route("/assignments/:id/complete", post(workers::complete_assignment))
        .route("/assignments/:id/fail", post(workers::fail_assignment))
        .route("/:id/availability", put(workers::set_availability))
}

/// Builds the application router.
///
/// # Routes
///
/// - `GET /health`, `GET /health/ready`, `GET /metrics`
/// - `/bookings/...` customer endpoints
/// - `/admin/bookings/...` admin overrides
/// - `/worker/...` worker lifecycle and availability
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics))
        .nest("/bookings", booking_routes())
        .nest("/admin", admin_routes())
        .nest("/worker", worker_routes())
        .with_state(state)
        .layer(correlation_id_layer())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
