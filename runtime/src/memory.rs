//! In-memory booking store.
//!
//! Each booking sits behind its own `tokio::sync::Mutex`; a unit of work
//! holds that lock until it commits or is dropped. Slot claims, buffer
//! reservations and the sweep indexes share one index lock, which is what
//! makes the hold check-and-insert atomic.

use crate::error::StoreError;
use crate::store::{BookingStore, UnitOfWork};
use async_trait::async_trait;
use booking_core::booking::BookingState;
use booking_core::buffer::{BufferBook, BufferRequest};
use booking_core::effect::StorageOp;
use booking_core::hold::SlotClaim;
use booking_core::slot::{SlotAllocator, SlotToken};
use booking_core::types::{AssignmentId, BookingId, SlotKey, TimeWindow, WorkerId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Default)]
struct Index {
    claims: HashMap<BookingId, SlotClaim>,
    buffers: BufferBook,
    hold_deadlines: HashMap<BookingId, DateTime<Utc>>,
    offer_deadlines: HashMap<BookingId, (AssignmentId, DateTime<Utc>)>,
    assignments: HashMap<AssignmentId, BookingId>,
}

impl Index {
    fn occupancy(
        &self,
        key: &SlotKey,
        pool_workers: &[WorkerId],
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> Vec<TimeWindow> {
        let blocking = |claim: &&SlotClaim| claim.is_active(now) && claim.window.overlaps(window);
        match key {
            SlotKey::Pool { .. } => {
                let claimed: Vec<&SlotClaim> = self
                    .claims
                    .values()
                    .filter(blocking)
                    .filter(|c| c.key == *key || c.key.worker().is_some_and(|w| pool_workers.contains(&w)))
                    .collect();
                let mut windows: Vec<TimeWindow> = claimed.iter().map(|c| c.window).collect();
                // A pool worker busy with another pool's job takes one unit away.
                for worker_id in pool_workers {
                    if claimed.iter().any(|c| c.key.worker() == Some(*worker_id)) {
                        continue;
                    }
                    let busy = self
                        .buffers
                        .for_worker(*worker_id)
                        .iter()
                        .filter(|request| !claimed.iter().any(|c| c.booking_id == request.booking_id))
                        .map(|request| request.window.with_trailing(Duration::minutes(request.buffer_minutes)))
                        .find(|held| held.overlaps(window));
                    windows.extend(busy);
                }
                windows
            },
            SlotKey::Worker { worker_id } => {
                let claimed: Vec<&SlotClaim> = self.claims.values().filter(blocking).filter(|c| c.key == *key).collect();
                let mut windows: Vec<TimeWindow> = claimed.iter().map(|c| c.window).collect();
                // Pool bookings the worker accepted block through their buffer.
                for request in self.buffers.for_worker(*worker_id) {
                    if claimed.iter().any(|c| c.booking_id == request.booking_id) {
                        continue;
                    }
                    let held = request.window.with_trailing(Duration::minutes(request.buffer_minutes));
                    if held.overlaps(window) {
                        windows.push(held);
                    }
                }
                windows
            },
        }
    }

    fn track(&mut self, state: &BookingState) {
        let Some(id) = state.id() else {
            return;
        };
        match state.hold_deadline() {
            Some(deadline) => self.hold_deadlines.insert(id, deadline),
            None => self.hold_deadlines.remove(&id),
        };
        match state.offer_deadline() {
            Some(offer) => self.offer_deadlines.insert(id, offer),
            None => self.offer_deadlines.remove(&id),
        };
        for assignment in &state.assignments {
            self.assignments.insert(assignment.id, id);
        }
    }
}

/// Default bound on waiting for a booking another transition holds
pub const DEFAULT_LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Default)]
struct Inner {
    bookings: RwLock<HashMap<BookingId, Arc<Mutex<BookingState>>>>,
    index: Mutex<Index>,
}

/// Process-local [`BookingStore`] used by tests and the in-memory backend
#[derive(Clone)]
pub struct InMemoryBookingStore {
    inner: Arc<Inner>,
    lock_timeout: std::time::Duration,
}

impl Default for InMemoryBookingStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl InMemoryBookingStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long `begin` waits for a locked booking before giving up
    /// with [`StoreError::Unavailable`]
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: std::time::Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    async fn cell(&self, id: BookingId) -> Option<Arc<Mutex<BookingState>>> {
        self.inner.bookings.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn occupancy(
        &self,
        key: &SlotKey,
        pool_workers: &[WorkerId],
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeWindow>, StoreError> {
        Ok(self.inner.index.lock().await.occupancy(key, pool_workers, window, now))
    }

    #[tracing::instrument(skip_all, fields(slot = %token.key))]
    async fn create_held(
        &self,
        state: &BookingState,
        token: &SlotToken,
        pool_workers: &[WorkerId],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (Some(id), Some(hold)) = (state.id(), state.hold) else {
            return Err(StoreError::Backend("held booking is missing its hold".to_string()));
        };

        let mut index = self.inner.index.lock().await;
        let occupied = index.occupancy(&token.key, pool_workers, &token.claim, now);
        SlotAllocator::ensure_free(&token.claim, token.capacity, &occupied).map_err(StoreError::Conflict)?;

        let mut bookings = self.inner.bookings.write().await;
        if bookings.contains_key(&id) {
            return Err(StoreError::Backend(format!("booking {id} already exists")));
        }
        index.claims.insert(id, SlotClaim::for_hold(&hold));
        index.track(state);
        bookings.insert(id, Arc::new(Mutex::new(state.clone())));
        Ok(())
    }

    async fn begin(&self, id: BookingId) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let cell = self.cell(id).await.ok_or(StoreError::NotFound(id))?;
        let guard = tokio::time::timeout(self.lock_timeout, cell.lock_owned())
            .await
            .map_err(|_| StoreError::Unavailable(format!("booking {id} is locked by another transition")))?;
        let draft = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard,
            draft,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn load(&self, id: BookingId) -> Result<Option<BookingState>, StoreError> {
        match self.cell(id).await {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn find_by_assignment(&self, id: AssignmentId) -> Result<Option<BookingId>, StoreError> {
        Ok(self.inner.index.lock().await.assignments.get(&id).copied())
    }

    async fn due_holds(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BookingId>, StoreError> {
        let index = self.inner.index.lock().await;
        let mut due: Vec<(DateTime<Utc>, BookingId)> = index
            .hold_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        due.sort_unstable();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn due_offers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(BookingId, AssignmentId)>, StoreError> {
        let index = self.inner.index.lock().await;
        let mut due: Vec<(DateTime<Utc>, BookingId, AssignmentId)> = index
            .offer_deadlines
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(booking_id, (assignment_id, deadline))| (*deadline, *booking_id, *assignment_id))
            .collect();
        due.sort_unstable();
        Ok(due.into_iter().take(limit).map(|(_, b, a)| (b, a)).collect())
    }

    async fn worker_busy(&self, candidate: &BufferRequest, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let index = self.inner.index.lock().await;
        if index.buffers.conflict(candidate).is_some() {
            return Ok(true);
        }
        let key = SlotKey::Worker {
            worker_id: candidate.worker_id,
        };
        let claim = candidate.window.with_trailing(Duration::minutes(candidate.buffer_minutes));
        Ok(index
            .claims
            .values()
            .any(|c| c.key == key && c.booking_id != candidate.booking_id && c.is_active(now) && c.window.overlaps(&claim)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<BookingState>,
    draft: BookingState,
    inner: Arc<Inner>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn state(&self) -> &BookingState {
        &self.draft
    }

    fn state_mut(&mut self) -> &mut BookingState {
        &mut self.draft
    }

    async fn commit(self: Box<Self>, ops: Vec<StorageOp>) -> Result<(), StoreError> {
        let Self {
            mut guard,
            draft,
            inner,
        } = *self;
        let Some(booking_id) = draft.id() else {
            return Err(StoreError::Backend("cannot commit an empty booking".to_string()));
        };

        let mut index = inner.index.lock().await;

        // Buffer changes are the only fallible ops; stage them first.
        let mut buffers = index.buffers.clone();
        for op in &ops {
            match op {
                StorageOp::ReserveBuffer(request) => buffers.reserve(*request).map_err(StoreError::Conflict)?,
                StorageOp::ReleaseBuffer { worker_id } => {
                    buffers.release(*worker_id, booking_id);
                },
                StorageOp::ReleaseClaim | StorageOp::PromoteHold | StorageOp::ExtendHold { .. } => {},
            }
        }
        index.buffers = buffers;

        for op in ops {
            match op {
                StorageOp::ReleaseClaim => {
                    index.claims.remove(&booking_id);
                },
                StorageOp::PromoteHold => {
                    if let Some(claim) = index.claims.get_mut(&booking_id) {
                        claim.expires_at = None;
                    }
                },
                StorageOp::ExtendHold { expires_at } => {
                    if let Some(claim) = index.claims.get_mut(&booking_id) {
                        claim.expires_at = Some(expires_at);
                    }
                },
                StorageOp::ReserveBuffer(_) | StorageOp::ReleaseBuffer { .. } => {},
            }
        }

        index.track(&draft);
        *guard = draft;
        Ok(())
    }
}
