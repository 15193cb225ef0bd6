//! # Booking Runtime
//!
//! Async orchestration for the booking engine.
//!
//! The core crate decides; this crate executes. [`service::BookingService`]
//! locks one booking through a [`store::UnitOfWork`], runs the reducer,
//! commits state together with the storage operations it asked for, then
//! publishes events and settles dispatches and refunds.
//!
//! ## Components
//!
//! - **Store**: [`store::BookingStore`] with atomic hold placement and
//!   per-booking single-writer units of work; [`memory::InMemoryBookingStore`]
//!   is the process-local backend
//! - **Pool**: [`pool::WorkerAssignmentPool`] ranks eligible workers
//! - **Sweeper**: [`sweeper::Sweeper`] expires lapsed holds and offers
//! - **Config**: [`config::ConfigCache`] hands out immutable snapshots
//! - **Gateway**: [`gateway::PaymentGateway`] collects and refunds money
//!
//! ## Example
//!
//! ```ignore
//! use booking_runtime::service::{BookingService, HoldRequest};
//!
//! let held = service.place_hold(request).await?;
//! let outcome = service.pay_segment(id, segment_id, amount, reference).await?;
//! assert_eq!(outcome.state.status(), Some(BookingStatus::Confirmed));
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod service;
pub mod store;
pub mod sweeper;

pub use error::{ServiceError, ServiceResult, StoreError};
pub use service::BookingService;

use serde::Serialize;

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with issues
    Degraded,
    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// The worse of two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one component
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Current status
    pub status: HealthStatus,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    /// Healthy component
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    /// Failed component
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status of all checks
    pub status: HealthStatus,
    /// Individual checks
    pub checks: Vec<HealthCheck>,
    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Builds a report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Report for a store ping
    #[must_use]
    pub fn from_store(ping: Result<(), StoreError>) -> Self {
        Self::new(vec![match ping {
            Ok(()) => HealthCheck::healthy("store"),
            Err(error) => HealthCheck::unhealthy("store", error.to_string()),
        }])
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}
