//! Integration tests for the booking service over the in-memory backend.
//!
//! Drives full flows (hold, pay, dispatch, sweep, cancel) on a manual clock
//! with a mock gateway, checking both the returned state and the side
//! effects observed by the gateway and the event bus.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use booking_core::booking::BookingState;
use booking_core::config::BookingConfig;
use booking_core::error::BookingError;
use booking_core::events::BookingEvent;
use booking_core::ledger::SegmentStatus;
use booking_core::types::{
    Actor, Address, AreaId, BookingId, BookingStatus, CustomerId, Money, PaymentMethod, PaymentStatus, Service,
    WorkerId,
};
use booking_runtime::config::ConfigCache;
use booking_runtime::directory::{Directory, InMemoryDirectory};
use booking_runtime::events::BroadcastPublisher;
use booking_runtime::gateway::MockPaymentGateway;
use booking_runtime::memory::InMemoryBookingStore;
use booking_runtime::retry::RetryPolicy;
use booking_runtime::service::{BookingService, HoldRequest, PaymentWebhook, WebhookStatus};
use booking_runtime::sweeper::Sweeper;
use booking_runtime::{ServiceError, ServiceResult};
use booking_testing::fixtures::{deposit_plan, service, tuesday, worker};
use booking_testing::init_tracing;
use booking_testing::mocks::{ManualClock, test_time};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    service: BookingService,
    directory: Arc<InMemoryDirectory>,
    gateway: Arc<MockPaymentGateway>,
    bus: BroadcastPublisher,
    clock: Arc<ManualClock>,
    catalog: Service,
    area_id: AreaId,
    workers: Vec<WorkerId>,
}

/// Workers are rated in descending order, so `workers[0]` is offered first.
async fn harness(ratings: &[f64], config: BookingConfig) -> Harness {
    init_tracing();
    let directory = Arc::new(InMemoryDirectory::new());
    let catalog = service();
    let area_id = AreaId::new();
    directory.add_service(catalog.clone()).await;

    let mut workers = Vec::new();
    for (index, rating) in ratings.iter().enumerate() {
        let w = worker(&format!("worker-{index}"), catalog.id, area_id, *rating);
        workers.push(w.id);
        directory.add_worker(w).await;
    }

    let gateway = MockPaymentGateway::shared();
    let bus = BroadcastPublisher::new(256);
    let clock = Arc::new(ManualClock::new(test_time()));
    let service = BookingService::new(
        Arc::new(InMemoryBookingStore::new()),
        directory.clone(),
        gateway.clone(),
        Arc::new(bus.clone()),
        Arc::new(ConfigCache::fixed(config)),
        clock.clone(),
    )
    .with_refund_retry(RetryPolicy::none());

    Harness {
        service,
        directory,
        gateway,
        bus,
        clock,
        catalog,
        area_id,
        workers,
    }
}

impl Harness {
    fn request(&self, start: DateTime<Utc>) -> HoldRequest {
        HoldRequest {
            customer_id: CustomerId::new(),
            service_id: self.catalog.id,
            area_id: self.area_id,
            start,
            address: Address {
                line: "4 Quay Street".to_string(),
                latitude: None,
                longitude: None,
            },
            preferred_worker: None,
            segments: Vec::new(),
        }
    }

    async fn hold(&self, start: DateTime<Utc>) -> BookingId {
        self.service.place_hold(self.request(start)).await.unwrap().id().unwrap()
    }

    async fn pay(&self, id: BookingId, index: usize, reference: &str) -> BookingState {
        let state = self.service.get(id).await.unwrap();
        let segment = &state.ledger.segments[index];
        self.service
            .pay_segment(id, segment.id, segment.amount, reference.to_string())
            .await
            .unwrap()
            .state
    }

    /// Hold at `start` paid in full
    async fn confirmed(&self, start: DateTime<Utc>) -> BookingState {
        let id = self.hold(start).await;
        self.pay(id, 0, &format!("pay-{id}")).await
    }

    fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.service.clone())
    }

    async fn refunded(&self) -> Money {
        self.gateway.refunds().await.iter().map(|r| r.amount).sum()
    }
}

fn offered_worker(state: &BookingState) -> (booking_core::types::AssignmentId, WorkerId) {
    let assignment = state.active_assignment().expect("an active offer");
    (assignment.id, assignment.worker_id)
}

fn domain_error<T: std::fmt::Debug>(result: ServiceResult<T>) -> BookingError {
    match result {
        Err(ServiceError::Booking(error)) => error,
        other => panic!("expected a domain error, got {other:?}"),
    }
}

// ============================================================================
// Slot races
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_on_one_worker_admit_exactly_one() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let worker_id = h.workers[0];

    let attempts = (0..12).map(|_| {
        let service = h.service.clone();
        let mut request = h.request(tuesday(10));
        request.preferred_worker = Some(worker_id);
        tokio::spawn(async move { service.place_hold(request).await })
    });
    let results = futures::future::join_all(attempts).await;

    let mut held = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => held += 1,
            Err(ServiceError::Booking(BookingError::SlotConflict { .. })) => {},
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(held, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_holds_are_capped_by_eligible_workers() {
    let h = harness(&[4.5, 4.0], BookingConfig::default()).await;

    let attempts = (0..8).map(|_| {
        let service = h.service.clone();
        let request = h.request(tuesday(10));
        tokio::spawn(async move { service.place_hold(request).await })
    });
    let held = futures::future::join_all(attempts)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(held, 2);
}

#[tokio::test]
async fn worker_busy_in_another_pool_leaves_no_capacity() {
    let h = harness(&[4.5], BookingConfig::default()).await;

    // The only worker also serves a second service in the same area.
    let ironing = Service {
        name: "Ironing".to_string(),
        ..service()
    };
    h.directory.add_service(ironing.clone()).await;
    let mut shared = h.directory.worker(h.workers[0]).await.unwrap().unwrap();
    shared.services.push(ironing.id);
    h.directory.add_worker(shared).await;

    let cleaning = h.confirmed(tuesday(10)).await;
    let (assignment_id, worker_id) = offered_worker(&cleaning);
    h.service.accept_assignment(assignment_id, worker_id).await.unwrap();

    let mut request = h.request(tuesday(10));
    request.service_id = ironing.id;
    let error = domain_error(h.service.place_hold(request.clone()).await);
    assert!(matches!(error, BookingError::SlotConflict { capacity: 1, occupied: 1, .. }));

    // Later the same day the worker is free again.
    request.start = tuesday(14);
    h.service.place_hold(request).await.unwrap();
}

#[tokio::test]
async fn area_without_workers_has_no_capacity() {
    let h = harness(&[], BookingConfig::default()).await;
    let error = domain_error(h.service.place_hold(h.request(tuesday(10))).await);
    assert!(matches!(error, BookingError::SlotConflict { capacity: 0, .. }));
}

#[tokio::test]
async fn calendar_rules_are_checked_before_claiming() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let error = domain_error(h.service.place_hold(h.request(tuesday(17))).await);
    assert!(matches!(error, BookingError::OutsideWorkingHours { .. }));

    let error = domain_error(h.service.place_hold(h.request(test_time() + Duration::days(45))).await);
    assert!(matches!(error, BookingError::TooFarInAdvance { .. }));
}

// ============================================================================
// Holds and payments
// ============================================================================

#[tokio::test]
async fn lapsed_hold_is_swept_and_slot_reopens() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    let sweeper = h.sweeper();

    h.clock.advance(Duration::minutes(9));
    assert_eq!(sweeper.sweep_once().await.holds_expired, 0);
    let error = domain_error(h.service.place_hold(h.request(tuesday(10))).await);
    assert!(matches!(error, BookingError::SlotConflict { .. }));

    h.clock.advance(Duration::minutes(1));
    let report = sweeper.sweep_once().await;
    assert_eq!(report.holds_expired, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(h.service.get(id).await.unwrap().status(), Some(BookingStatus::Expired));

    h.service.place_hold(h.request(tuesday(10))).await.unwrap();
    assert_eq!(h.sweeper().sweep_once().await.holds_expired, 0);
}

#[tokio::test]
async fn wallet_payment_extends_the_hold() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    h.service.initiate_payment(id, PaymentMethod::Wallet).await.unwrap();

    h.clock.advance(Duration::minutes(12));
    assert_eq!(h.sweeper().sweep_once().await.holds_expired, 0);

    h.clock.advance(Duration::minutes(3));
    assert_eq!(h.sweeper().sweep_once().await.holds_expired, 1);
    let state = h.service.get(id).await.unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Cancelled));
}

#[tokio::test]
async fn booking_confirms_only_when_every_segment_is_paid() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let mut request = h.request(tuesday(10));
    request.segments = deposit_plan(2_000, 8_000);
    let id = h.service.place_hold(request).await.unwrap().id().unwrap();

    let state = h.pay(id, 1, "balance-first").await;
    assert_eq!(state.status(), Some(BookingStatus::PendingPayment));
    assert_eq!(state.booking.as_ref().unwrap().payment_status, PaymentStatus::PartiallyPaid);

    let state = h.pay(id, 0, "deposit").await;
    assert_eq!(state.status(), Some(BookingStatus::Confirmed));
    assert!(state.hold.is_none());
    // auto-assign offered the only worker
    assert_eq!(offered_worker(&state).1, h.workers[0]);
}

#[tokio::test]
async fn duplicate_webhook_credits_once() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    let segment = h.service.get(id).await.unwrap().ledger.segments[0].clone();
    let mut events = h.bus.subscribe();

    let webhook = PaymentWebhook {
        booking_id: id,
        segment_id: segment.id,
        amount: segment.amount,
        reference: "gw_evt_77".to_string(),
        status: WebhookStatus::Succeeded,
        failure_reason: None,
    };
    let first = h.service.verify_payment(webhook.clone()).await.unwrap();
    let second = h.service.verify_payment(webhook).await.unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(second.state.status(), Some(BookingStatus::Confirmed));
    assert_eq!(second.state.ledger.segments[0].status, SegmentStatus::Paid);

    let mut paid = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BookingEvent::SegmentPaid { .. }) {
            paid += 1;
        }
    }
    assert_eq!(paid, 1);
}

#[tokio::test]
async fn failed_webhook_leaves_segment_payable() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    let segment = h.service.get(id).await.unwrap().ledger.segments[0].clone();

    let outcome = h
        .service
        .verify_payment(PaymentWebhook {
            booking_id: id,
            segment_id: segment.id,
            amount: segment.amount,
            reference: "gw_evt_1".to_string(),
            status: WebhookStatus::Failed,
            failure_reason: Some("card expired".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(outcome.state.ledger.segments[0].status, SegmentStatus::Failed);

    let state = h.pay(id, 0, "gw_evt_2").await;
    assert_eq!(state.status(), Some(BookingStatus::Confirmed));
}

#[tokio::test]
async fn wrong_amount_is_a_mismatch() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    let segment = h.service.get(id).await.unwrap().ledger.segments[0].clone();

    let error = domain_error(
        h.service
            .pay_segment(id, segment.id, Money::from_cents(100), "short".to_string())
            .await,
    );
    assert!(matches!(error, BookingError::PaymentMismatch { .. }));
    assert_eq!(h.service.get(id).await.unwrap().status(), Some(BookingStatus::Held));
}

#[tokio::test]
async fn late_payment_is_refunded() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    h.clock.advance(Duration::minutes(11));
    h.sweeper().sweep_once().await;

    let segment = h.service.get(id).await.unwrap().ledger.segments[0].clone();
    let outcome = h
        .service
        .pay_segment(id, segment.id, segment.amount, "gw_late".to_string())
        .await
        .unwrap();

    assert!(outcome.late_payment);
    assert_eq!(outcome.state.status(), Some(BookingStatus::Expired));
    assert_eq!(h.refunded().await, segment.amount);
}

#[tokio::test]
async fn payment_racing_an_unswept_expiry_is_refunded() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;
    h.clock.advance(Duration::minutes(10));

    let state = h.pay(id, 0, "gw_race").await;
    assert_eq!(state.status(), Some(BookingStatus::Expired));
    assert_eq!(h.refunded().await, Money::from_cents(10_000));
}

#[tokio::test]
async fn hold_with_payment_collects_the_first_segment() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let outcome = h
        .service
        .place_hold_with_payment(h.request(tuesday(10)), PaymentMethod::Wallet)
        .await
        .unwrap();
    assert_eq!(outcome.state.status(), Some(BookingStatus::Confirmed));

    let id = h.hold(tuesday(13)).await;
    assert_eq!(h.service.get(id).await.unwrap().status(), Some(BookingStatus::Held));

    h.gateway.decline_charges(true);
    let result = h
        .service
        .place_hold_with_payment(h.request(tuesday(16)), PaymentMethod::Gateway)
        .await;
    assert!(matches!(result, Err(ServiceError::Gateway(_))));
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn buffer_keeps_a_busy_worker_out_of_dispatch() {
    let h = harness(&[4.9, 4.1], BookingConfig::default()).await;

    let first = h.confirmed(tuesday(10)).await;
    let (assignment_id, worker_id) = offered_worker(&first);
    assert_eq!(worker_id, h.workers[0]);
    h.service.accept_assignment(assignment_id, worker_id).await.unwrap();

    // 12:00 falls inside the 30 minute buffer after the 10:00-12:00 job.
    let second = h.confirmed(tuesday(12)).await;
    assert_eq!(offered_worker(&second).1, h.workers[1]);

    let forced = domain_error(h.service.assign_worker(second.id().unwrap(), Some(h.workers[0])).await);
    assert!(matches!(forced, BookingError::BufferConflict { .. }));
}

#[tokio::test]
async fn rejection_with_no_candidates_left_flags_the_booking() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let state = h.confirmed(tuesday(10)).await;
    let id = state.id().unwrap();
    let (assignment_id, worker_id) = offered_worker(&state);

    let state = h
        .service
        .reject_assignment(assignment_id, worker_id, "too far".to_string())
        .await
        .unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Confirmed));
    assert!(state.booking.as_ref().unwrap().unassignable);
    assert!(state.active_assignment().is_none());

    let error = domain_error(h.service.assign_worker(id, None).await);
    assert!(matches!(error, BookingError::NoAvailableWorker { remaining_candidates: 0, .. }));
}

#[tokio::test]
async fn unanswered_offer_moves_to_the_next_worker() {
    let h = harness(&[4.9, 4.1], BookingConfig::default()).await;
    let state = h.confirmed(tuesday(10)).await;
    let id = state.id().unwrap();
    assert_eq!(offered_worker(&state).1, h.workers[0]);

    h.clock.advance(Duration::minutes(15));
    let report = h.sweeper().sweep_once().await;
    assert_eq!(report.offers_expired, 1);

    let state = h.service.get(id).await.unwrap();
    assert_eq!(offered_worker(&state).1, h.workers[1]);
}

#[tokio::test]
async fn only_the_offered_worker_may_answer() {
    let h = harness(&[4.9, 4.1], BookingConfig::default()).await;
    let state = h.confirmed(tuesday(10)).await;
    let (assignment_id, _) = offered_worker(&state);

    let error = domain_error(h.service.accept_assignment(assignment_id, h.workers[1]).await);
    assert!(matches!(error, BookingError::NotAssignedWorker { .. }));
}

#[tokio::test]
async fn manual_dispatch_when_auto_assign_is_off() {
    let config = BookingConfig {
        auto_assign_workers_on_booking: false,
        ..BookingConfig::default()
    };
    let h = harness(&[4.5], config).await;
    let state = h.confirmed(tuesday(10)).await;
    assert!(state.active_assignment().is_none());

    let state = h.service.assign_worker(state.id().unwrap(), None).await.unwrap();
    assert_eq!(offered_worker(&state).1, h.workers[0]);
}

#[tokio::test]
async fn unavailable_workers_are_skipped() {
    let h = harness(&[4.9, 4.1], BookingConfig::default()).await;
    h.service.set_worker_availability(h.workers[0], false).await.unwrap();

    let state = h.confirmed(tuesday(10)).await;
    assert_eq!(offered_worker(&state).1, h.workers[1]);
}

// ============================================================================
// Cancellation and refunds
// ============================================================================

#[tokio::test]
async fn early_cancellation_refunds_in_full() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.confirmed(tuesday(10)).await.id().unwrap();

    let state = h
        .service
        .cancel(id, Actor::Customer, "plans changed".to_string())
        .await
        .unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Cancelled));
    assert_eq!(h.refunded().await, Money::from_cents(10_000));
    assert_eq!(state.booking.as_ref().unwrap().payment_status, PaymentStatus::Refunded);

    // the slot is free again
    h.hold(tuesday(10)).await;
}

#[tokio::test]
async fn late_cancellation_keeps_the_fee() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.confirmed(tuesday(10)).await.id().unwrap();
    h.clock.advance(Duration::hours(3));

    let state = h
        .service
        .cancel(id, Actor::Customer, "sick".to_string())
        .await
        .unwrap();
    assert_eq!(state.booking.as_ref().unwrap().cancellation_fee, Some(Money::from_cents(1_000)));
    assert_eq!(h.refunded().await, Money::from_cents(9_000));

    let again = domain_error(h.service.cancel(id, Actor::Customer, "twice".to_string()).await);
    assert!(matches!(again, BookingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn failed_refund_can_be_retried_by_an_admin() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.confirmed(tuesday(10)).await.id().unwrap();
    h.gateway.fail_refunds(true);

    let state = h.service.reject(id, "duplicate order".to_string()).await.unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Rejected));
    let segment = state.ledger.segments[0].clone();
    assert_eq!(segment.status, SegmentStatus::Paid);
    assert_eq!(h.refunded().await, Money::ZERO);

    h.gateway.fail_refunds(false);
    let state = h.service.request_refund(id, segment.id, None).await.unwrap();
    assert_eq!(state.ledger.segments[0].status, SegmentStatus::Refunded);
    assert_eq!(h.refunded().await, Money::from_cents(10_000));
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn hold_pay_assign_start_complete() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let mut events = h.bus.subscribe();

    let held = h.service.place_hold(h.request(tuesday(10))).await.unwrap();
    let id = held.id().unwrap();
    let otp = held.booking.as_ref().unwrap().otp.clone();
    assert_eq!(otp.len(), 4);

    let state = h.pay(id, 0, "gw_full").await;
    assert_eq!(state.status(), Some(BookingStatus::Confirmed));
    let (assignment_id, worker_id) = offered_worker(&state);

    let state = h.service.accept_assignment(assignment_id, worker_id).await.unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Assigned));

    let state = h.service.start_assignment(assignment_id, worker_id).await.unwrap();
    assert_eq!(state.status(), Some(BookingStatus::InProgress));

    let wrong = if otp == "0000" { "1111" } else { "0000" };
    let error = domain_error(h.service.complete_assignment(assignment_id, worker_id, wrong.to_string()).await);
    assert_eq!(error, BookingError::InvalidOtp);

    let state = h
        .service
        .complete_assignment(assignment_id, worker_id, otp.clone())
        .await
        .unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Completed));

    // completing twice is absorbed
    let state = h.service.complete_assignment(assignment_id, worker_id, otp).await.unwrap();
    assert_eq!(state.status(), Some(BookingStatus::Completed));

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names.first(), Some(&"hold_placed"));
    assert!(names.contains(&"booking_confirmed"));
    assert_eq!(names.last(), Some(&"booking_completed"));
}

#[tokio::test]
async fn admin_notes_and_health() {
    let h = harness(&[4.5], BookingConfig::default()).await;
    let id = h.hold(tuesday(10)).await;

    let state = h
        .service
        .add_note(id, "ops".to_string(), "customer asked for a call".to_string())
        .await
        .unwrap();
    assert_eq!(state.booking.as_ref().unwrap().admin_notes.len(), 1);

    assert!(h.service.health().await.is_healthy());
    let missing = domain_error(h.service.get(BookingId::new()).await);
    assert!(matches!(missing, BookingError::NotFound { .. }));
}
