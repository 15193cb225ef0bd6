//! Worker assignment pool.
//!
//! Picks the next worker to offer a booking to. Dispatch is sequential: one
//! pending offer per booking, candidates ranked by the configured
//! [`SelectionPolicy`](booking_core::assignment::SelectionPolicy) and
//! filtered so nobody is offered a job that would break their buffer.

use crate::directory::Directory;
use crate::error::StoreError;
use crate::store::BookingStore;
use booking_core::buffer::BufferRequest;
use booking_core::config::BookingConfig;
use booking_core::effect::DispatchRequest;
use booking_core::types::{AssignmentId, Worker};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Outcome of one dispatch round
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// Offer the booking to `worker`
    Offer {
        /// Best remaining candidate
        worker: Worker,
        /// Candidates still available after this one
        remaining: usize,
    },
    /// Nobody left to ask
    Exhausted {
        /// Untried workers skipped only because they are busy
        remaining: usize,
    },
}

/// Candidate lookup and ranking
#[derive(Clone)]
pub struct WorkerAssignmentPool {
    directory: Arc<dyn Directory>,
    store: Arc<dyn BookingStore>,
}

impl WorkerAssignmentPool {
    /// Creates a pool over the given directory and store
    #[must_use]
    pub fn new(directory: Arc<dyn Directory>, store: Arc<dyn BookingStore>) -> Self {
        Self { directory, store }
    }

    /// Eligible, untried, non-conflicting workers in offer order.
    ///
    /// The preferred worker goes first whenever they qualify.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or store cannot be read.
    pub async fn candidates(
        &self,
        request: &DispatchRequest,
        config: &BookingConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<Worker>, StoreError> {
        Ok(self.scan(request, config, now).await?.0)
    }

    /// Next worker to offer the booking to.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or store cannot be read.
    pub async fn select(
        &self,
        request: &DispatchRequest,
        config: &BookingConfig,
        now: DateTime<Utc>,
    ) -> Result<Selection, StoreError> {
        let (candidates, busy) = self.scan(request, config, now).await?;
        let mut candidates = candidates.into_iter();
        Ok(match candidates.next() {
            Some(worker) => Selection::Offer {
                worker,
                remaining: candidates.len(),
            },
            None => Selection::Exhausted { remaining: busy },
        })
    }

    #[tracing::instrument(skip_all, fields(booking_id = %request.booking_id))]
    async fn scan(
        &self,
        request: &DispatchRequest,
        config: &BookingConfig,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Worker>, usize), StoreError> {
        let eligible = self.directory.eligible_workers(request.service_id, request.area_id).await?;

        let mut busy = 0;
        let mut candidates = Vec::with_capacity(eligible.len());
        for worker in eligible {
            if request.excluded.contains(&worker.id) {
                continue;
            }
            let probe = BufferRequest {
                worker_id: worker.id,
                booking_id: request.booking_id,
                assignment_id: AssignmentId::new(),
                window: request.window,
                buffer_minutes: config.booking_buffer_time_minutes,
            };
            if self.store.worker_busy(&probe, now).await? {
                tracing::debug!(worker_id = %worker.id, "skipping busy worker");
                busy += 1;
                continue;
            }
            candidates.push(worker);
        }

        config.worker_selection_policy.ranking().rank(&mut candidates);
        if let Some(preferred) = request.preferred_worker {
            if let Some(position) = candidates.iter().position(|w| w.id == preferred) {
                let worker = candidates.remove(position);
                candidates.insert(0, worker);
            }
        }
        Ok((candidates, busy))
    }
}
