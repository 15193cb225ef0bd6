//! Axum HTTP surface for the booking engine.
//!
//! The imperative shell around [`booking_runtime::BookingService`]:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Imperative Shell (Axum)         │  ← HTTP, JSON, correlation IDs
//! │  - Request parsing                      │  ← CORS, timeouts
//! │  - Error → status mapping               │  ← Tracing, metrics
//! ├─────────────────────────────────────────┤
//! │         BookingService                  │  ← locking, effects, events
//! ├─────────────────────────────────────────┤
//! │         BookingReducer                  │  ← pure state machine
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at an axum handler
//! 2. **Extract** path IDs and the JSON body
//! 3. **Call** one service operation
//! 4. **Map** the result to a [`handlers::BookingView`] or an [`AppError`]
//!
//! # Example
//!
//! ```ignore
//! use booking_web::{AppState, build_router};
//!
//! let app = build_router(AppState::new(service), Duration::from_secs(30));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::AppConfig;
pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, CorrelationIdExt, correlation_id_layer};
pub use routes::build_router;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
