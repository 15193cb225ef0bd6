//! HTTP request handlers.
//!
//! Handlers are thin: parse the request, call one
//! [`BookingService`](booking_runtime::BookingService) operation, render a
//! [`BookingView`]. Every rule lives below them.

pub mod admin;
pub mod bookings;
pub mod health;
pub mod workers;

pub use bookings::{BookingView, PaymentResponse};
pub use health::health_check;
