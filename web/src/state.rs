//! Application state for Axum handlers.

use booking_runtime::BookingService;
use metrics_exporter_prometheus::PrometheusHandle;

/// State shared across all HTTP handlers.
///
/// Cheap to clone: the service is a bundle of `Arc`s.
#[derive(Clone)]
pub struct AppState {
    /// Booking orchestration
    pub service: BookingService,
    /// Prometheus renderer, when the exporter is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Creates state without a metrics renderer
    #[must_use]
    pub const fn new(service: BookingService) -> Self {
        Self { service, metrics: None }
    }

    /// Serves `/metrics` from `handle`
    #[must_use]
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }
}
