//! Booking service: the orchestration layer behind every entry point.
//!
//! Each operation follows the same shape:
//!
//! 1. take one configuration snapshot,
//! 2. lock the booking through a [`UnitOfWork`](crate::store::UnitOfWork),
//! 3. run the reducer (plus any follow-up actions it sends),
//! 4. commit state and storage operations together,
//! 5. publish events, then settle dispatches and refunds.
//!
//! A guard failure drops the unit of work, so nothing staged is persisted.

use crate::HealthReport;
use crate::config::ConfigCache;
use crate::directory::Directory;
use crate::error::{ServiceError, ServiceResult, StoreError};
use crate::events::EventPublisher;
use crate::gateway::{GatewayError, PaymentGateway};
use crate::metrics::BookingMetrics;
use crate::pool::{Selection, WorkerAssignmentPool};
use crate::retry::{RetryPolicy, retry_transient};
use crate::store::BookingStore;
use booking_core::booking::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
use booking_core::config::BookingConfig;
use booking_core::effect::{DispatchRequest, Effect, RefundRequest};
use booking_core::environment::Clock;
use booking_core::error::BookingError;
use booking_core::events::BookingEvent;
use booking_core::ledger::SegmentSpec;
use booking_core::reducer::Reducer;
use booking_core::slot::{SlotAllocator, SlotRequest, SlotToken};
use booking_core::types::{
    Actor, Address, AreaId, AssignmentId, BookingId, BookingStatus, CustomerId, Money, PaymentMethod, SegmentId,
    ServiceId, SlotKey, Worker, WorkerId,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Customer request for a new booking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HoldRequest {
    /// Customer placing the booking
    pub customer_id: CustomerId,
    /// Service to book
    pub service_id: ServiceId,
    /// Service area of the address
    pub area_id: AreaId,
    /// Requested start
    pub start: DateTime<Utc>,
    /// Where the job takes place
    pub address: Address,
    /// Book this worker's calendar instead of the area pool
    #[serde(default)]
    pub preferred_worker: Option<WorkerId>,
    /// Payment plan; empty means one full-price segment
    #[serde(default)]
    pub segments: Vec<SegmentSpec>,
}

/// Gateway callback outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Money captured
    Succeeded,
    /// Attempt failed
    Failed,
}

/// Payment gateway callback
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWebhook {
    /// Booking the payment belongs to
    pub booking_id: BookingId,
    /// Segment being paid
    pub segment_id: SegmentId,
    /// Amount captured
    pub amount: Money,
    /// Gateway payment reference, the idempotency key
    pub reference: String,
    /// Outcome
    pub status: WebhookStatus,
    /// Failure detail
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Result of a payment call
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentOutcome {
    /// Booking after the payment
    pub state: BookingState,
    /// The reference had already been processed; nothing changed
    pub duplicate: bool,
    /// Money arrived after the booking closed and is being refunded
    pub late_payment: bool,
}

enum Followup {
    Dispatch(DispatchRequest),
    Refund(RefundRequest),
}

struct Applied {
    state: BookingState,
    followups: Vec<Followup>,
}

/// Orchestrates the booking state machine over a store, a worker
/// directory, a payment gateway and an event publisher
#[derive(Clone)]
pub struct BookingService {
    store: Arc<dyn BookingStore>,
    directory: Arc<dyn Directory>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
    config: Arc<ConfigCache>,
    clock: Arc<dyn Clock>,
    pool: WorkerAssignmentPool,
    reducer: BookingReducer,
    refund_retry: RetryPolicy,
}

impl BookingService {
    /// Wires a service from its collaborators
    #[must_use]
    pub fn new(
        store: Arc<dyn BookingStore>,
        directory: Arc<dyn Directory>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn EventPublisher>,
        config: Arc<ConfigCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pool = WorkerAssignmentPool::new(Arc::clone(&directory), Arc::clone(&store));
        Self {
            store,
            directory,
            gateway,
            publisher,
            config,
            clock,
            pool,
            reducer: BookingReducer::new(),
            refund_retry: RetryPolicy::default(),
        }
    }

    /// Overrides the backoff used for gateway refunds
    #[must_use]
    pub const fn with_refund_retry(mut self, policy: RetryPolicy) -> Self {
        self.refund_retry = policy;
        self
    }

    /// Current time on the service clock
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current configuration snapshot
    pub async fn config(&self) -> Arc<BookingConfig> {
        self.config.snapshot().await
    }

    /// The candidate pool, for admin tooling
    #[must_use]
    pub const fn pool(&self) -> &WorkerAssignmentPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Customer operations
    // ------------------------------------------------------------------

    /// Validates the slot and atomically places a hold on it.
    ///
    /// With a preferred worker the hold claims that worker's calendar
    /// (capacity 1); otherwise it claims the area pool, whose capacity is
    /// the number of eligible workers.
    ///
    /// # Errors
    ///
    /// Calendar errors from [`SlotAllocator::validate`], `SlotConflict` when
    /// the slot is full, `NotFound` for an unknown service.
    #[tracing::instrument(skip(self, request), fields(service_id = %request.service_id, start = %request.start))]
    pub async fn place_hold(&self, request: HoldRequest) -> ServiceResult<BookingState> {
        let config = self.config.snapshot().await;
        let now = self.clock.now();

        let service = self
            .directory
            .service(request.service_id)
            .await?
            .ok_or_else(|| BookingError::not_found("service", request.service_id))?;

        let (key, capacity, pool_workers) = match request.preferred_worker {
            Some(worker_id) => {
                let worker = self
                    .directory
                    .worker(worker_id)
                    .await?
                    .ok_or_else(|| BookingError::not_found("worker", worker_id))?;
                if !worker.can_serve(service.id, request.area_id) {
                    return Err(BookingError::invalid(format!(
                        "worker {worker_id} cannot take this service in this area"
                    ))
                    .into());
                }
                (SlotKey::Worker { worker_id }, 1, Vec::new())
            },
            None => {
                let eligible = self.directory.eligible_workers(service.id, request.area_id).await?;
                let capacity = u32::try_from(eligible.len()).unwrap_or(u32::MAX);
                let key = SlotKey::Pool {
                    service_id: service.id,
                    area_id: request.area_id,
                };
                (key, capacity, eligible.into_iter().map(|w| w.id).collect())
            },
        };

        let slot = SlotRequest {
            key,
            start: request.start,
            duration: service.duration(),
        };
        let (window, claim) = SlotAllocator::validate(&slot, &config, now)?;
        let token = SlotToken {
            key,
            window,
            claim,
            capacity,
        };

        let booking_id = BookingId::new();
        let otp = format!("{:04}", rand::thread_rng().gen_range(0..10_000_u32));
        let env = BookingEnvironment::new(Arc::clone(&self.clock), config);
        let mut state = BookingState::new();
        let effects = self.reducer.reduce(
            &mut state,
            BookingAction::PlaceHold {
                booking_id,
                customer_id: request.customer_id,
                service,
                area_id: request.area_id,
                address: request.address,
                slot: token,
                preferred_worker: request.preferred_worker,
                segments: request.segments,
                otp,
            },
            &env,
        );
        if let Some(error) = state.last_error.take() {
            return Err(error.into());
        }

        if let Err(error) = self.store.create_held(&state, &token, &pool_workers, now).await {
            if matches!(error, StoreError::Conflict(BookingError::SlotConflict { .. })) {
                BookingMetrics::record_slot_conflict();
            }
            tracing::info!(%error, slot = %key, "hold refused");
            return Err(error.into());
        }

        for effect in effects.into_iter().flat_map(Effect::flatten) {
            if let Effect::Publish(event) = effect {
                self.emit(&event);
            }
        }
        tracing::info!(%booking_id, slot = %key, "hold placed");
        Ok(state)
    }

    /// Places a hold, initiates payment and collects the first segment
    /// through the gateway straight away.
    ///
    /// # Errors
    ///
    /// Any error of [`Self::place_hold`]; a declined charge is recorded on
    /// the segment and returned as [`ServiceError::Gateway`] while the hold
    /// stays pending.
    pub async fn place_hold_with_payment(
        &self,
        request: HoldRequest,
        method: PaymentMethod,
    ) -> ServiceResult<PaymentOutcome> {
        let held = self.place_hold(request).await?;
        let booking_id = held.id().ok_or_else(|| BookingError::not_found("booking", "(new)"))?;
        let state = self.initiate_payment(booking_id, method).await?;

        let (segment_id, amount) = state
            .ledger
            .segments
            .first()
            .map(|s| (s.id, s.amount))
            .ok_or_else(|| BookingError::invalid("booking has no payment segments"))?;

        match self.gateway.charge(booking_id, segment_id, amount, method).await {
            Ok(reference) => self.pay_segment(booking_id, segment_id, amount, reference).await,
            Err(error) => {
                tracing::warn!(%booking_id, %segment_id, %error, "first segment charge failed");
                self.fail_segment(booking_id, segment_id, error.to_string(), None).await?;
                Err(error.into())
            },
        }
    }

    /// Customer starts paying; extends the hold per payment method
    ///
    /// # Errors
    ///
    /// `HoldExpired` once the hold lapsed, `InvalidTransition` after the
    /// booking left the payment phase.
    #[tracing::instrument(skip(self))]
    pub async fn initiate_payment(&self, id: BookingId, method: PaymentMethod) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::InitiatePayment { method }).await
    }

    /// Records a successful segment payment.
    ///
    /// A reference seen before is absorbed: the booking is returned
    /// unchanged with `duplicate` set.
    ///
    /// # Errors
    ///
    /// `PaymentMismatch` for a wrong amount or unknown segment.
    #[tracing::instrument(skip(self, reference), fields(reference = %reference))]
    pub async fn pay_segment(
        &self,
        id: BookingId,
        segment_id: SegmentId,
        amount: Money,
        reference: String,
    ) -> ServiceResult<PaymentOutcome> {
        let action = BookingAction::PaySegment {
            segment_id,
            amount,
            reference,
        };
        match self.run(id, action).await {
            Ok(state) => {
                let late_payment = matches!(
                    state.status(),
                    Some(BookingStatus::Expired | BookingStatus::Cancelled | BookingStatus::Rejected)
                );
                if late_payment {
                    tracing::warn!(booking_id = %id, %segment_id, "payment arrived after close, refunding");
                }
                Ok(PaymentOutcome {
                    state,
                    duplicate: false,
                    late_payment,
                })
            },
            Err(ServiceError::Booking(BookingError::DuplicateWebhook { reference })) => {
                BookingMetrics::record_duplicate_webhook();
                tracing::info!(booking_id = %id, %reference, "duplicate payment ignored");
                Ok(PaymentOutcome {
                    state: self.get(id).await?,
                    duplicate: true,
                    late_payment: false,
                })
            },
            Err(error) => Err(error),
        }
    }

    /// Records a failed payment attempt; the segment can be paid again
    ///
    /// # Errors
    ///
    /// `PaymentMismatch` for an unknown segment, `InvalidTransition` for a
    /// segment that is already paid.
    pub async fn fail_segment(
        &self,
        id: BookingId,
        segment_id: SegmentId,
        reason: String,
        reference: Option<String>,
    ) -> ServiceResult<BookingState> {
        self.run(
            id,
            BookingAction::FailSegment {
                segment_id,
                reason,
                reference,
            },
        )
        .await
    }

    /// Handles a gateway callback
    ///
    /// # Errors
    ///
    /// See [`Self::pay_segment`] and [`Self::fail_segment`].
    #[tracing::instrument(skip(self, webhook), fields(booking_id = %webhook.booking_id, reference = %webhook.reference))]
    pub async fn verify_payment(&self, webhook: PaymentWebhook) -> ServiceResult<PaymentOutcome> {
        match webhook.status {
            WebhookStatus::Succeeded => {
                self.pay_segment(webhook.booking_id, webhook.segment_id, webhook.amount, webhook.reference)
                    .await
            },
            WebhookStatus::Failed => {
                let reason = webhook.failure_reason.unwrap_or_else(|| "declined by gateway".to_string());
                let result = self
                    .fail_segment(webhook.booking_id, webhook.segment_id, reason, Some(webhook.reference))
                    .await;
                match result {
                    Ok(state) => Ok(PaymentOutcome {
                        state,
                        duplicate: false,
                        late_payment: false,
                    }),
                    Err(ServiceError::Booking(BookingError::DuplicateWebhook { .. })) => {
                        BookingMetrics::record_duplicate_webhook();
                        Ok(PaymentOutcome {
                            state: self.get(webhook.booking_id).await?,
                            duplicate: true,
                            late_payment: false,
                        })
                    },
                    Err(error) => Err(error),
                }
            },
        }
    }

    /// Cancels a booking. Customers pay the late fee inside the cutoff.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` for a booking already closed.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel(&self, id: BookingId, by: Actor, reason: String) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::Cancel { by, reason }).await
    }

    // ------------------------------------------------------------------
    // Admin operations
    // ------------------------------------------------------------------

    /// Admin rejection with full refund
    ///
    /// # Errors
    ///
    /// `InvalidTransition` for a booking already closed.
    #[tracing::instrument(skip(self, reason))]
    pub async fn reject(&self, id: BookingId, reason: String) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::Reject { reason }).await
    }

    /// Staffs a booking.
    ///
    /// With a worker this is a forced assignment that bypasses ranking but
    /// still honours buffers; without one it runs a dispatch round.
    ///
    /// # Errors
    ///
    /// `NoAvailableWorker` when dispatch finds nobody (the booking is also
    /// flagged unassignable), `BufferConflict` when the forced worker is
    /// busy, `NotFound` for an unknown worker.
    #[tracing::instrument(skip(self))]
    pub async fn assign_worker(&self, id: BookingId, worker_id: Option<WorkerId>) -> ServiceResult<BookingState> {
        if let Some(worker_id) = worker_id {
            self.directory
                .worker(worker_id)
                .await?
                .ok_or_else(|| BookingError::not_found("worker", worker_id))?;
            let state = self
                .run(
                    id,
                    BookingAction::ForceAssign {
                        assignment_id: AssignmentId::new(),
                        worker_id,
                    },
                )
                .await?;
            self.stamp_assignment(worker_id).await;
            return Ok(state);
        }

        let state = self.get(id).await?;
        let booking = state
            .booking
            .as_ref()
            .ok_or_else(|| BookingError::not_found("booking", id))?;
        if booking.status != BookingStatus::Confirmed || state.active_assignment().is_some() {
            return Err(BookingError::transition(booking.status, "dispatch").into());
        }
        let request = DispatchRequest {
            booking_id: id,
            service_id: booking.service_id,
            area_id: booking.area_id,
            window: booking.window,
            preferred_worker: booking.preferred_worker,
            excluded: state.tried_workers(),
        };

        match self.dispatch(&request).await? {
            (state, None) => Ok(state),
            (_, Some(remaining_candidates)) => Err(BookingError::NoAvailableWorker {
                booking_id: id,
                remaining_candidates,
            }
            .into()),
        }
    }

    /// Admin refund of a paid segment, full or partial
    ///
    /// # Errors
    ///
    /// `PaymentMismatch` when the amount exceeds what is refundable.
    #[tracing::instrument(skip(self))]
    pub async fn request_refund(
        &self,
        id: BookingId,
        segment_id: SegmentId,
        amount: Option<Money>,
    ) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::RequestRefund { segment_id, amount }).await
    }

    /// Appends an admin note
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a blank note.
    pub async fn add_note(&self, id: BookingId, author: String, note: String) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::AddAdminNote { author, note }).await
    }

    // ------------------------------------------------------------------
    // Worker operations
    // ------------------------------------------------------------------

    /// Worker accepts an offer and reserves the padded window.
    ///
    /// If the reservation collides with another of the worker's jobs the
    /// offer is rejected on their behalf and dispatch moves on.
    ///
    /// # Errors
    ///
    /// `NotAssignedWorker`, `BufferConflict`, or a transition error once
    /// the offer lapsed.
    #[tracing::instrument(skip(self))]
    pub async fn accept_assignment(&self, assignment_id: AssignmentId, worker_id: WorkerId) -> ServiceResult<BookingState> {
        let id = self.locate(assignment_id, worker_id).await?;
        match self.run(id, BookingAction::AcceptAssignment { assignment_id }).await {
            Ok(state) => {
                self.stamp_assignment(worker_id).await;
                Ok(state)
            },
            Err(ServiceError::Booking(conflict @ BookingError::BufferConflict { .. })) => {
                tracing::warn!(booking_id = %id, %worker_id, "accept collided with another job");
                let release = BookingAction::RejectAssignment {
                    assignment_id,
                    reason: conflict.to_string(),
                };
                if let Err(error) = self.run(id, release).await {
                    tracing::error!(booking_id = %id, %error, "could not withdraw conflicting offer");
                }
                Err(conflict.into())
            },
            Err(error) => Err(error),
        }
    }

    /// Worker declines; dispatch offers the next candidate
    ///
    /// # Errors
    ///
    /// `NotAssignedWorker` or a transition error.
    #[tracing::instrument(skip(self, reason))]
    pub async fn reject_assignment(
        &self,
        assignment_id: AssignmentId,
        worker_id: WorkerId,
        reason: String,
    ) -> ServiceResult<BookingState> {
        let id = self.locate(assignment_id, worker_id).await?;
        self.run(id, BookingAction::RejectAssignment { assignment_id, reason }).await
    }

    /// Worker arrives and starts the job
    ///
    /// # Errors
    ///
    /// `NotAssignedWorker` or `InvalidTransition` before acceptance.
    #[tracing::instrument(skip(self))]
    pub async fn start_assignment(&self, assignment_id: AssignmentId, worker_id: WorkerId) -> ServiceResult<BookingState> {
        let id = self.locate(assignment_id, worker_id).await?;
        self.run(id, BookingAction::StartAssignment { assignment_id }).await
    }

    /// Worker finishes; requires the customer's completion code
    ///
    /// # Errors
    ///
    /// `InvalidOtp`, `NotAssignedWorker` or `InvalidTransition`.
    #[tracing::instrument(skip(self, otp))]
    pub async fn complete_assignment(
        &self,
        assignment_id: AssignmentId,
        worker_id: WorkerId,
        otp: String,
    ) -> ServiceResult<BookingState> {
        let id = self.locate(assignment_id, worker_id).await?;
        self.run(id, BookingAction::CompleteAssignment { assignment_id, otp }).await
    }

    /// Worker cannot finish; the booking goes back to dispatch
    ///
    /// # Errors
    ///
    /// `NotAssignedWorker` or `InvalidTransition`.
    #[tracing::instrument(skip(self, reason))]
    pub async fn fail_assignment(
        &self,
        assignment_id: AssignmentId,
        worker_id: WorkerId,
        reason: String,
    ) -> ServiceResult<BookingState> {
        let id = self.locate(assignment_id, worker_id).await?;
        self.run(id, BookingAction::FailAssignment { assignment_id, reason }).await
    }

    /// Toggles a worker's availability
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown worker.
    pub async fn set_worker_availability(&self, worker_id: WorkerId, available: bool) -> ServiceResult<Worker> {
        let worker = self
            .directory
            .set_availability(worker_id, available)
            .await?
            .ok_or_else(|| BookingError::not_found("worker", worker_id))?;
        tracing::info!(%worker_id, available, "worker availability changed");
        Ok(worker)
    }

    // ------------------------------------------------------------------
    // Reads and sweeps
    // ------------------------------------------------------------------

    /// Loads a booking
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown booking.
    pub async fn get(&self, id: BookingId) -> ServiceResult<BookingState> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| BookingError::not_found("booking", id).into())
    }

    /// Expires a lapsed hold; a no-op when the booking moved on meanwhile
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn expire_hold(&self, id: BookingId) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::ExpireHold).await
    }

    /// Times out a pending offer; a no-op once answered
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn expire_offer(&self, id: BookingId, assignment_id: AssignmentId) -> ServiceResult<BookingState> {
        self.run(id, BookingAction::ExpireOffer { assignment_id }).await
    }

    /// Store reachability
    pub async fn health(&self) -> HealthReport {
        HealthReport::from_store(self.store.ping().await)
    }

    pub(crate) fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn environment(&self) -> BookingEnvironment {
        BookingEnvironment::new(Arc::clone(&self.clock), self.config.snapshot().await)
    }

    fn emit(&self, event: &BookingEvent) {
        self.publisher.publish(event);
        BookingMetrics::record_event(event);
    }

    async fn run(&self, id: BookingId, action: BookingAction) -> ServiceResult<BookingState> {
        let applied = self.apply(id, action).await?;
        if applied.followups.is_empty() {
            return Ok(applied.state);
        }
        self.settle(applied.followups).await;
        self.get(id).await
    }

    /// One unit of work: reduce, commit, publish.
    async fn apply(&self, id: BookingId, action: BookingAction) -> ServiceResult<Applied> {
        let started = Instant::now();
        let name = action.name();
        let env = self.environment().await;
        let mut uow = self.store.begin(id).await?;

        let mut queue = VecDeque::from([action]);
        let mut ops = Vec::new();
        let mut events = Vec::new();
        let mut followups = Vec::new();
        while let Some(next) = queue.pop_front() {
            let effects = self.reducer.reduce(uow.state_mut(), next, &env);
            if let Some(error) = uow.state_mut().last_error.take() {
                if !matches!(error, BookingError::DuplicateWebhook { .. }) {
                    tracing::warn!(booking_id = %id, action = name, %error, "transition refused");
                }
                return Err(error.into());
            }
            for effect in effects.into_iter().flat_map(Effect::flatten) {
                match effect {
                    Effect::Send(action) => queue.push_back(*action),
                    Effect::Storage(op) => ops.push(op),
                    Effect::Publish(event) => events.push(event),
                    Effect::Dispatch(request) => followups.push(Followup::Dispatch(request)),
                    Effect::Refund(request) => followups.push(Followup::Refund(request)),
                    Effect::None | Effect::Sequential(_) => {},
                }
            }
        }

        let state = uow.state().clone();
        tracing::debug!(booking_id = %id, action = name, ops = ops.len(), "committing");
        uow.commit(ops).await?;

        for event in &events {
            self.emit(event);
        }
        if let Some(status) = state.status() {
            tracing::info!(booking_id = %id, action = name, %status, "transition applied");
        }
        BookingMetrics::record_transition(name, started.elapsed());
        Ok(Applied { state, followups })
    }

    /// Runs post-commit work. Failures are logged; the booking is already
    /// consistent and the sweep or an admin can pick up from there.
    async fn settle(&self, followups: Vec<Followup>) {
        let mut pending = VecDeque::from(followups);
        while let Some(followup) = pending.pop_front() {
            let result = match followup {
                Followup::Refund(request) => self.refund(&request).await,
                Followup::Dispatch(request) => self.dispatch(&request).await.map(|_| Vec::new()),
            };
            match result {
                Ok(more) => pending.extend(more),
                Err(error) => tracing::error!(%error, "follow-up failed"),
            }
        }
    }

    async fn refund(&self, request: &RefundRequest) -> ServiceResult<Vec<Followup>> {
        let gateway = &self.gateway;
        let reference = request.payment_reference.as_str();
        let amount = request.amount;
        let outcome = retry_transient(
            self.refund_retry,
            move || gateway.refund(reference, amount),
            GatewayError::is_transient,
        )
        .await;

        let action = match outcome {
            Ok(refund_reference) => BookingAction::RefundSucceeded {
                segment_id: request.segment_id,
                amount,
                refund_reference,
            },
            Err(error) => {
                tracing::warn!(
                    booking_id = %request.booking_id,
                    segment = %request.segment_id,
                    %error,
                    "refund failed"
                );
                BookingAction::RefundFailed {
                    segment_id: request.segment_id,
                    amount,
                    reason: error.to_string(),
                }
            },
        };
        Ok(self.apply(request.booking_id, action).await?.followups)
    }

    /// One dispatch round. Returns the booking and, when nobody could be
    /// offered the job, the count of busy candidates.
    async fn dispatch(&self, request: &DispatchRequest) -> ServiceResult<(BookingState, Option<usize>)> {
        let config = self.config.snapshot().await;
        let selection = self.pool.select(request, &config, self.clock.now()).await?;
        match selection {
            Selection::Offer { worker, remaining } => {
                tracing::info!(booking_id = %request.booking_id, worker_id = %worker.id, remaining, "offering booking");
                let action = BookingAction::OfferWorker {
                    assignment_id: AssignmentId::new(),
                    worker_id: worker.id,
                };
                Ok((self.apply(request.booking_id, action).await?.state, None))
            },
            Selection::Exhausted { remaining } => {
                tracing::warn!(booking_id = %request.booking_id, remaining, "no worker available");
                let action = BookingAction::MarkUnassignable {
                    remaining_candidates: remaining,
                };
                Ok((self.apply(request.booking_id, action).await?.state, Some(remaining)))
            },
        }
    }

    async fn locate(&self, assignment_id: AssignmentId, worker_id: WorkerId) -> ServiceResult<BookingId> {
        let id = self
            .store
            .find_by_assignment(assignment_id)
            .await?
            .ok_or_else(|| BookingError::not_found("assignment", assignment_id))?;
        let state = self.get(id).await?;
        match state.assignment(assignment_id) {
            Some(assignment) if assignment.worker_id == worker_id => Ok(id),
            Some(_) => Err(BookingError::NotAssignedWorker { assignment_id }.into()),
            None => Err(BookingError::not_found("assignment", assignment_id).into()),
        }
    }

    async fn stamp_assignment(&self, worker_id: WorkerId) {
        if let Err(error) = self.directory.record_assignment(worker_id, self.clock.now()).await {
            tracing::warn!(%worker_id, %error, "could not record assignment time");
        }
    }
}
