//! Background sweep for lapsed holds and unanswered offers.
//!
//! Each pass asks the store for due bookings and feeds them through the
//! ordinary service path, so a sweep transition takes the same per-booking
//! lock as user traffic. The reducer ignores bookings that moved on after
//! the scan, which makes racing a payment or an accept harmless. A failed
//! transition is logged and picked up again on the next pass.

use crate::metrics::BookingMetrics;
use crate::service::BookingService;
use std::time::Duration;
use tokio::sync::watch;

/// Counts from one sweep pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Holds expired or cancelled
    pub holds_expired: usize,
    /// Offers timed out
    pub offers_expired: usize,
    /// Transitions that failed and will be retried
    pub failures: usize,
}

/// Periodic expiry sweep
pub struct Sweeper {
    service: BookingService,
    interval: Duration,
    batch_size: usize,
}

impl Sweeper {
    /// Creates a sweeper; defaults to a 15 second interval and batches of 100
    #[must_use]
    pub const fn new(service: BookingService) -> Self {
        Self {
            service,
            interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }

    /// Sets the pause between passes
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets how many due items one pass handles per kind
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Runs one pass at the service clock's current time
    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.service.now();
        let store = self.service.store();
        let mut report = SweepReport::default();

        match store.due_holds(now, self.batch_size).await {
            Ok(due) => {
                for id in due {
                    match self.service.expire_hold(id).await {
                        Ok(_) => report.holds_expired += 1,
                        Err(error) => {
                            tracing::warn!(booking_id = %id, %error, "hold expiry failed, retrying next pass");
                            report.failures += 1;
                        },
                    }
                }
            },
            Err(error) => {
                tracing::error!(%error, "could not scan for lapsed holds");
                report.failures += 1;
            },
        }

        match store.due_offers(now, self.batch_size).await {
            Ok(due) => {
                for (id, assignment_id) in due {
                    match self.service.expire_offer(id, assignment_id).await {
                        Ok(_) => report.offers_expired += 1,
                        Err(error) => {
                            tracing::warn!(booking_id = %id, %assignment_id, %error, "offer timeout failed, retrying next pass");
                            report.failures += 1;
                        },
                    }
                }
            },
            Err(error) => {
                tracing::error!(%error, "could not scan for lapsed offers");
                report.failures += 1;
            },
        }

        BookingMetrics::record_sweep(report.failures);
        if report != SweepReport::default() {
            tracing::info!(
                holds_expired = report.holds_expired,
                offers_expired = report.offers_expired,
                failures = report.failures,
                "sweep pass finished"
            );
        }
        report
    }

    /// Sweeps every interval until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "sweeper started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sweeper stopped");
    }
}
