//! Worker buffer reservations.
//!
//! While an assignment is active its worker holds a [`BufferRequest`] for
//! the service window padded by the buffer minutes on both sides. A second
//! job for the same worker is refused when its service window intersects
//! that padded window. [`BufferBook`] is the in-memory bookkeeping used by
//! the memory store and by tests; the PostgreSQL store enforces the same
//! rule with an exclusion constraint.

use crate::error::{BookingError, BookingResult};
use crate::types::{AssignmentId, BookingId, TimeWindow, WorkerId};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transient reservation of a worker's padded window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequest {
    /// Worker being reserved
    pub worker_id: WorkerId,
    /// Booking the worker is assigned to
    pub booking_id: BookingId,
    /// Assignment that created the reservation
    pub assignment_id: AssignmentId,
    /// Service window (unpadded)
    pub window: TimeWindow,
    /// Buffer minutes in force when reserved
    pub buffer_minutes: i64,
}

impl BufferRequest {
    /// Service window padded on both sides
    #[must_use]
    pub fn padded(&self) -> TimeWindow {
        self.window.padded(Duration::minutes(self.buffer_minutes))
    }

    /// True when either job falls inside the other's padded window
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.worker_id == other.worker_id
            && self.booking_id != other.booking_id
            && (self.padded().overlaps(&other.window) || other.padded().overlaps(&self.window))
    }
}

/// Buffer reservations grouped by worker
#[derive(Clone, Debug, Default)]
pub struct BufferBook {
    by_worker: HashMap<WorkerId, Vec<BufferRequest>>,
}

impl BufferBook {
    /// Creates an empty book
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First reservation that would conflict with `candidate`
    #[must_use]
    pub fn conflict(&self, candidate: &BufferRequest) -> Option<&BufferRequest> {
        self.by_worker
            .get(&candidate.worker_id)?
            .iter()
            .find(|existing| existing.conflicts_with(candidate))
    }

    /// Reserves the worker's padded window. Re-reserving for the same
    /// booking replaces the previous reservation.
    ///
    /// # Errors
    ///
    /// `BufferConflict` with the conflicting padded window.
    pub fn reserve(&mut self, request: BufferRequest) -> BookingResult<()> {
        if let Some(existing) = self.conflict(&request) {
            return Err(BookingError::BufferConflict {
                worker_id: request.worker_id,
                window: existing.padded(),
            });
        }
        let entries = self.by_worker.entry(request.worker_id).or_default();
        entries.retain(|e| e.booking_id != request.booking_id);
        entries.push(request);
        Ok(())
    }

    /// Releases the booking's reservation for the worker
    pub fn release(&mut self, worker_id: WorkerId, booking_id: BookingId) -> Option<BufferRequest> {
        let entries = self.by_worker.get_mut(&worker_id)?;
        let position = entries.iter().position(|e| e.booking_id == booking_id)?;
        let released = entries.swap_remove(position);
        if entries.is_empty() {
            self.by_worker.remove(&worker_id);
        }
        Some(released)
    }

    /// Reservations held by a worker
    #[must_use]
    pub fn for_worker(&self, worker_id: WorkerId) -> &[BufferRequest] {
        self.by_worker.get(&worker_id).map_or(&[], Vec::as_slice)
    }
}
