//! Persistence seam for bookings.
//!
//! Two guarantees live here rather than in application memory:
//!
//! - `create_held` re-checks slot capacity and inserts the claim as one
//!   atomic step, so concurrent holds on the same slot cannot both succeed.
//! - `begin` hands out a [`UnitOfWork`] that owns the booking exclusively
//!   until it commits or is dropped, serializing worker, admin, customer
//!   and sweep transitions on the same booking.

use crate::error::StoreError;
use async_trait::async_trait;
use booking_core::booking::BookingState;
use booking_core::buffer::BufferRequest;
use booking_core::effect::StorageOp;
use booking_core::slot::SlotToken;
use booking_core::types::{AssignmentId, BookingId, SlotKey, TimeWindow, WorkerId};
use chrono::{DateTime, Utc};

/// Exclusive, transactional access to one booking.
///
/// Dropping without committing discards every staged change.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Booking as loaded (plus any staged mutation)
    fn state(&self) -> &BookingState;

    /// Mutable access for the reducer
    fn state_mut(&mut self) -> &mut BookingState;

    /// Persists the state and applies the storage operations atomically.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when an operation violates a storage
    /// invariant (e.g. a buffer overlap); nothing is persisted in that case.
    async fn commit(self: Box<Self>, ops: Vec<StorageOp>) -> Result<(), StoreError>;
}

/// Booking persistence
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Claim windows that currently block `key`.
    ///
    /// For a pool key this covers pool claims, claims held against any of
    /// `pool_workers`, and one buffer window for each pool worker already
    /// committed to another pool's job. For a worker key, the worker's
    /// claims plus its buffer reservations. Lapsed holds are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn occupancy(
        &self,
        key: &SlotKey,
        pool_workers: &[WorkerId],
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeWindow>, StoreError>;

    /// Atomically re-checks capacity for `token` and stores a newly held
    /// booking together with its slot claim.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] carrying `SlotConflict` when the slot filled
    /// up since the check.
    async fn create_held(
        &self,
        state: &BookingState,
        token: &SlotToken,
        pool_workers: &[WorkerId],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Locks the booking for a transition
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown booking.
    async fn begin(&self, id: BookingId) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Reads a booking without locking it
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn load(&self, id: BookingId) -> Result<Option<BookingState>, StoreError>;

    /// Booking owning an assignment
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn find_by_assignment(&self, id: AssignmentId) -> Result<Option<BookingId>, StoreError>;

    /// Bookings awaiting payment whose hold lapsed at or before `now`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn due_holds(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BookingId>, StoreError>;

    /// Pending offers whose acceptance deadline passed
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn due_offers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(BookingId, AssignmentId)>, StoreError>;

    /// Whether `candidate`'s worker is already committed around its window:
    /// an overlapping buffer reservation, or another booking's active claim
    /// held directly against the worker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn worker_busy(&self, candidate: &BufferRequest, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Liveness probe
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend is unreachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
