//! Error types for web handlers.
//!
//! [`AppError`] bridges service failures and HTTP responses. Domain
//! rejections keep their taxonomy code and carry their serialized context
//! under `details`, so a client can see the conflicting window or the
//! remaining candidate count without parsing the message.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use booking_core::error::BookingError;
use booking_runtime::gateway::GatewayError;
use booking_runtime::{ServiceError, StoreError};
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```ignore
/// async fn handler(State(state): State<AppState>) -> Result<Json<BookingView>, AppError> {
///     let booking = state.service.get(id).await?;
///     Ok(Json(BookingView::customer(&booking)))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: String,
    /// Structured context of a domain rejection
    details: Option<serde_json::Value>,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            details: None,
            source: None,
        }
    }

    /// Create a new error with a source error.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach structured context
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), "BAD_REQUEST".to_string())
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message.into(),
            "SERVICE_UNAVAILABLE".to_string(),
        )
    }

    /// HTTP status of this error
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Status code for a domain rejection
const fn booking_status(error: &BookingError) -> StatusCode {
    match error {
        BookingError::SlotConflict { .. }
        | BookingError::BufferConflict { .. }
        | BookingError::InvalidTransition { .. }
        | BookingError::NoAvailableWorker { .. } => StatusCode::CONFLICT,
        BookingError::OutsideWorkingHours { .. }
        | BookingError::TooFarInAdvance { .. }
        | BookingError::StartInPast { .. }
        | BookingError::PaymentMismatch { .. }
        | BookingError::InvalidOtp => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::HoldExpired { .. } => StatusCode::GONE,
        BookingError::NotFound { .. } => StatusCode::NOT_FOUND,
        BookingError::NotAssignedWorker { .. } => StatusCode::FORBIDDEN,
        BookingError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        // Absorbed by the service; reaching here means a caller replayed it directly.
        BookingError::DuplicateWebhook { .. } => StatusCode::OK,
    }
}

impl From<BookingError> for AppError {
    fn from(error: BookingError) -> Self {
        let status = booking_status(&error);
        let mut app = Self::new(status, error.to_string(), error.code().to_string());
        if let Ok(details) = serde_json::to_value(&error) {
            app = app.with_details(details);
        }
        app
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(error) => error.into(),
            StoreError::NotFound(id) => Self::not_found("booking", id),
            StoreError::Unavailable(_) => {
                Self::unavailable("Storage is temporarily unavailable").with_source(error.into())
            },
            other => Self::internal("An internal error occurred").with_source(other.into()),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        match &error {
            GatewayError::Declined { reason } => Self::new(
                StatusCode::PAYMENT_REQUIRED,
                format!("payment declined: {reason}"),
                "PAYMENT_DECLINED".to_string(),
            ),
            GatewayError::Timeout | GatewayError::Unavailable { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                "Payment gateway is unavailable".to_string(),
                "GATEWAY_ERROR".to_string(),
            )
            .with_source(error.into()),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Booking(error) => error.into(),
            ServiceError::Store(error) => error.into(),
            ServiceError::Gateway(error) => error.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    /// Error code (for client error handling).
    code: String,
    /// Human-readable error message.
    message: String,
    /// Context of a domain rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(source) = &self.source {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                );
            } else {
                tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Internal server error"
                );
            }
        } else if self.status.is_client_error() {
            tracing::warn!(status = %self.status, code = %self.code, message = %self.message, "request rejected");
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };

        (self.status, Json(body)).into_response()
    }
}

/// Convert `anyhow::Error` to `AppError`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}
