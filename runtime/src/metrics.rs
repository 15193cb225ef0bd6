//! Prometheus metrics for the booking engine.
//!
//! Counters are driven from published domain events plus a few outcomes
//! that never become events (slot conflicts, duplicate webhooks, sweep
//! runs). Without an installed recorder every call is a no-op, which is
//! what unit tests rely on.

use booking_core::events::BookingEvent;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics setup
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter bound to a dedicated scrape address
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Creates an exporter for `addr`
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Registers metric descriptions and installs the HTTP exporter.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder.build().map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("metrics exporter stopped");
            }
        });
        register_metrics();
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "metrics exporter listening");
        Ok(())
    }

    /// Current metrics in Prometheus text format, once started
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }

    /// Handle for rendering from another endpoint
    #[must_use]
    pub fn handle(&self) -> Option<PrometheusHandle> {
        self.handle.clone()
    }
}

fn register_metrics() {
    describe_counter!("bookings.holds.placed", "Holds placed on a slot");
    describe_counter!("bookings.holds.conflicts", "Hold attempts refused with a slot conflict");
    describe_counter!("bookings.confirmed", "Bookings whose required segments were all paid");
    describe_counter!("bookings.expired", "Holds that lapsed without payment");
    describe_counter!("bookings.cancelled", "Cancelled bookings");
    describe_counter!("bookings.completed", "Completed bookings");
    describe_counter!("assignments.offered", "Worker offers made");
    describe_counter!("assignments.unassignable", "Bookings that ran out of candidates");
    describe_counter!("refunds.failed", "Refunds the gateway refused");
    describe_counter!("webhooks.duplicate", "Payment webhooks already processed");
    describe_counter!("sweep.runs", "Sweep passes");
    describe_counter!("sweep.failures", "Sweep transitions that failed and will be retried");
    describe_histogram!("booking.transition.duration_seconds", "Time spent inside one unit of work");
}

/// Booking metrics recorder
pub struct BookingMetrics;

impl BookingMetrics {
    /// Counts a published domain event
    pub fn record_event(event: &BookingEvent) {
        let name = match event {
            BookingEvent::HoldPlaced { .. } => "bookings.holds.placed",
            BookingEvent::BookingConfirmed { .. } => "bookings.confirmed",
            BookingEvent::HoldExpired { .. } => "bookings.expired",
            BookingEvent::BookingCancelled { .. } => "bookings.cancelled",
            BookingEvent::BookingCompleted { .. } => "bookings.completed",
            BookingEvent::WorkerOffered { .. } => "assignments.offered",
            BookingEvent::BookingUnassignable { .. } => "assignments.unassignable",
            BookingEvent::RefundFailed { .. } => "refunds.failed",
            _ => return,
        };
        counter!(name).increment(1);
    }

    /// Hold refused because the slot is full
    pub fn record_slot_conflict() {
        counter!("bookings.holds.conflicts").increment(1);
    }

    /// Webhook short-circuited on a known reference
    pub fn record_duplicate_webhook() {
        counter!("webhooks.duplicate").increment(1);
    }

    /// One unit of work, labelled by the action that started it
    pub fn record_transition(action: &'static str, duration: Duration) {
        histogram!("booking.transition.duration_seconds", "action" => action).record(duration.as_secs_f64());
    }

    /// One sweep pass and its failed transitions
    pub fn record_sweep(failures: usize) {
        counter!("sweep.runs").increment(1);
        if failures > 0 {
            counter!("sweep.failures").increment(u64::try_from(failures).unwrap_or(u64::MAX));
        }
    }
}
