//! Booking state machine tests driven through the reducer.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use booking_core::booking::{BookingAction, BookingReducer};
use booking_core::config::BookingConfig;
use booking_core::effect::{Effect, StorageOp};
use booking_core::error::BookingError;
use booking_core::ledger::SegmentStatus;
use booking_core::assignment::AssignmentStatus;
use booking_core::types::{Actor, BookingStatus, Money, PaymentMethod, PaymentStatus, WorkerId};
use booking_testing::assertions::{self, assert_no_effects, assert_publishes, assert_storage};
use booking_testing::fixtures::{Scenario, deposit_plan};
use booking_testing::properties::segment_plan;
use booking_testing::ReducerTest;
use chrono::Duration;
use proptest::prelude::*;

// ============================================================================
// Holds and payment
// ============================================================================

#[test]
fn place_hold_creates_held_booking() {
    let mut scenario = Scenario::new();
    let effects = scenario.hold();

    let booking = scenario.state.booking.as_ref().unwrap();
    assert_eq!(booking.status, BookingStatus::Held);
    assert_eq!(booking.payment_status, PaymentStatus::Unpaid);
    assert_eq!(booking.total_price, Money::from_cents(10_000));

    let hold = scenario.state.hold.unwrap();
    assert_eq!(hold.expires_at, scenario.now() + Duration::minutes(10));
    assert_eq!(hold.claim.end, booking.window.end + Duration::minutes(30));

    assertions::assert_effects_count(&effects, 1);
    assert_publishes(&effects, "hold_placed");
}

#[test]
fn second_place_hold_is_refused() {
    let mut scenario = Scenario::new();
    scenario.hold();
    let again = scenario.place_hold_action(Vec::new());
    let effects = scenario.send(again);

    assert_no_effects(&effects);
    assert!(matches!(scenario.error(), Some(BookingError::InvalidTransition { .. })));
    assert_eq!(scenario.state.status(), Some(BookingStatus::Held));
}

#[test]
fn mismatched_plan_is_refused() {
    let mut scenario = Scenario::new();
    scenario.hold_with_segments(deposit_plan(3_000, 5_000));

    assert!(scenario.state.booking.is_none());
    assert!(matches!(scenario.error(), Some(BookingError::PaymentMismatch { .. })));
}

#[test]
fn gateway_payment_extends_the_hold() {
    let mut scenario = Scenario::new();
    scenario.hold();
    let effects = scenario.send(BookingAction::InitiatePayment {
        method: PaymentMethod::Gateway,
    });

    let expected = scenario.now() + Duration::minutes(60);
    assert_eq!(scenario.state.hold.unwrap().expires_at, expected);
    assert_eq!(scenario.state.status(), Some(BookingStatus::PendingPayment));
    assert_storage(&effects, &StorageOp::ExtendHold { expires_at: expected });
    assert_publishes(&effects, "payment_initiated");
}

#[test]
fn wallet_payment_uses_wallet_timeout() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.send(BookingAction::InitiatePayment {
        method: PaymentMethod::Wallet,
    });

    assert_eq!(
        scenario.state.hold_deadline(),
        Some(scenario.now() + Duration::minutes(15))
    );
}

#[test]
fn initiating_payment_on_lapsed_hold_fails() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.advance(Duration::minutes(10));
    let effects = scenario.send(BookingAction::InitiatePayment {
        method: PaymentMethod::Gateway,
    });

    assert_no_effects(&effects);
    assert!(matches!(scenario.error(), Some(BookingError::HoldExpired { .. })));
}

#[test]
fn full_payment_confirms_and_dispatches() {
    let mut scenario = Scenario::new();
    scenario.hold();
    let effects = scenario.pay(0, "pay-1");

    assert_eq!(scenario.state.status(), Some(BookingStatus::Confirmed));
    assert!(scenario.state.hold.is_none());
    assert_eq!(
        scenario.state.booking.as_ref().unwrap().payment_status,
        PaymentStatus::Paid
    );
    assert_storage(&effects, &StorageOp::PromoteHold);
    assert_publishes(&effects, "segment_paid");
    assert_publishes(&effects, "booking_confirmed");
    let dispatch = assertions::dispatch(&effects).unwrap();
    assert!(dispatch.excluded.is_empty());
}

#[test]
fn confirmation_without_auto_assign_does_not_dispatch() {
    let config = BookingConfig {
        auto_assign_workers_on_booking: false,
        ..BookingConfig::default()
    };
    let mut scenario = Scenario::with_config(config);
    let effects = scenario.confirm();

    assert_eq!(scenario.state.status(), Some(BookingStatus::Confirmed));
    assert!(assertions::dispatch(&effects).is_none());
}

#[test]
fn deposit_alone_does_not_confirm() {
    let mut scenario = Scenario::new();
    scenario.hold_with_segments(deposit_plan(3_000, 7_000));
    let effects = scenario.pay(0, "deposit");

    assert_eq!(scenario.state.status(), Some(BookingStatus::PendingPayment));
    assert_eq!(
        scenario.state.booking.as_ref().unwrap().payment_status,
        PaymentStatus::PartiallyPaid
    );
    assert!(!effects.iter().any(|e| matches!(e, Effect::Storage(StorageOp::PromoteHold))));

    let effects = scenario.pay(1, "balance");
    assert_eq!(scenario.state.status(), Some(BookingStatus::Confirmed));
    assert_storage(&effects, &StorageOp::PromoteHold);
}

proptest! {
    #[test]
    fn split_payment_confirms_only_on_the_last_segment(plan in segment_plan(10_000)) {
        let mut scenario = Scenario::new();
        scenario.hold_with_segments(plan.clone());
        prop_assert!(scenario.error().is_none());

        // Newest segment first, so order never matters.
        for index in (0..plan.len()).rev() {
            scenario.pay(index, &format!("split-{index}"));
            prop_assert!(scenario.error().is_none());
            let confirmed = scenario.state.status() == Some(BookingStatus::Confirmed);
            prop_assert_eq!(confirmed, index == 0);
        }
    }
}

#[test]
fn duplicate_webhook_changes_nothing() {
    let mut scenario = Scenario::new();
    scenario.hold_with_segments(deposit_plan(3_000, 7_000));
    scenario.pay(0, "deposit");
    let before = scenario.state.clone();

    let effects = scenario.pay(0, "deposit");

    assert_no_effects(&effects);
    assert!(matches!(scenario.error(), Some(BookingError::DuplicateWebhook { .. })));
    assert_eq!(scenario.state.ledger, before.ledger);
    assert_eq!(scenario.state.booking, before.booking);
}

#[test]
fn wrong_amount_is_a_mismatch() {
    let mut scenario = Scenario::new();
    scenario.hold();
    let segment_id = scenario.segment_id(0);
    scenario.send(BookingAction::PaySegment {
        segment_id,
        amount: Money::from_cents(9_999),
        reference: "short".to_string(),
    });

    assert!(matches!(scenario.error(), Some(BookingError::PaymentMismatch { .. })));
    assert_eq!(scenario.state.status(), Some(BookingStatus::Held));
}

#[test]
fn failed_segment_is_recorded_and_retryable() {
    let mut scenario = Scenario::new();
    scenario.hold();
    let segment_id = scenario.segment_id(0);
    let effects = scenario.send(BookingAction::FailSegment {
        segment_id,
        reason: "card declined".to_string(),
        reference: Some("fail-1".to_string()),
    });

    assert_publishes(&effects, "segment_failed");
    assert_eq!(
        scenario.state.ledger.segment(segment_id).unwrap().status,
        SegmentStatus::Failed
    );

    scenario.pay(0, "retry-1");
    assert_eq!(scenario.state.status(), Some(BookingStatus::Confirmed));
}

// ============================================================================
// Expiry
// ============================================================================

#[test]
fn hold_is_not_expired_before_deadline() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.advance(Duration::minutes(9));
    let state = scenario.state.clone();

    ReducerTest::new(BookingReducer::new())
        .with_env(scenario.env.clone())
        .given_state(state)
        .when_action(BookingAction::ExpireHold)
        .then_state(|state| {
            assert_eq!(state.status(), Some(BookingStatus::Held));
            assert!(state.last_error.is_none());
        })
        .then_effects(|effects| {
            assert_no_effects(effects);
        })
        .run();
}

#[test]
fn lapsed_hold_expires_and_releases_the_slot() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.advance(Duration::minutes(10));
    let state = scenario.state.clone();

    ReducerTest::new(BookingReducer::new())
        .with_env(scenario.env.clone())
        .given_state(state)
        .when_action(BookingAction::ExpireHold)
        .then_state(|state| {
            assert_eq!(state.status(), Some(BookingStatus::Expired));
            assert!(state.hold.is_none());
        })
        .then_effects(|effects| {
            assert_storage(effects, &StorageOp::ReleaseClaim);
            assert_publishes(effects, "hold_expired");
        })
        .run();
}

#[test]
fn expiring_twice_is_a_no_op() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.advance(Duration::minutes(11));
    scenario.send(BookingAction::ExpireHold);
    let effects = scenario.send(BookingAction::ExpireHold);

    assert_no_effects(&effects);
    assert!(scenario.error().is_none());
}

#[test]
fn abandoned_payment_cancels_and_refunds_deposit() {
    let mut scenario = Scenario::new();
    scenario.hold_with_segments(deposit_plan(3_000, 7_000));
    scenario.pay(0, "deposit");
    scenario.advance(Duration::minutes(61));
    let effects = scenario.send(BookingAction::ExpireHold);

    assert_eq!(scenario.state.status(), Some(BookingStatus::Cancelled));
    assert_storage(&effects, &StorageOp::ReleaseClaim);
    let refunds = assertions::refunds(&effects);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, Money::from_cents(3_000));
    assert_eq!(refunds[0].payment_reference, "deposit");
}

#[test]
fn payment_after_expiry_is_recorded_and_refunded() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.advance(Duration::minutes(11));
    let effects = scenario.pay(0, "late-1");

    assert_eq!(scenario.state.status(), Some(BookingStatus::Expired));
    assert!(scenario.state.ledger.has_processed("late-1"));
    assert_publishes(&effects, "hold_expired");
    let refunds = assertions::refunds(&effects);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, Money::from_cents(10_000));
    assert!(!effects.iter().any(|e| matches!(e, Effect::Storage(StorageOp::PromoteHold))));
}

// ============================================================================
// Cancellation and rejection
// ============================================================================

#[test]
fn early_cancellation_refunds_everything() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let effects = scenario.send(BookingAction::Cancel {
        by: Actor::Customer,
        reason: "plans changed".to_string(),
    });

    let booking = scenario.state.booking.as_ref().unwrap();
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.cancellation_fee, None);
    let refunds = assertions::refunds(&effects);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, Money::from_cents(10_000));
    assert_storage(&effects, &StorageOp::ReleaseClaim);
}

#[test]
fn late_cancellation_retains_fee() {
    let mut scenario = Scenario::new();
    scenario.hold_with_segments(deposit_plan(3_000, 7_000));
    scenario.pay(0, "deposit");
    scenario.pay(1, "balance");
    scenario.advance(Duration::hours(3));

    let effects = scenario.send(BookingAction::Cancel {
        by: Actor::Customer,
        reason: "sick".to_string(),
    });

    assert_eq!(
        scenario.state.booking.as_ref().unwrap().cancellation_fee,
        Some(Money::from_cents(1_000))
    );
    assert_publishes(&effects, "cancellation_fee_charged");
    let refunds = assertions::refunds(&effects);
    let total: Money = refunds.iter().map(|r| r.amount).sum();
    assert_eq!(total, Money::from_cents(9_000));
    // Latest segment is refunded first.
    assert_eq!(refunds[0].payment_reference, "balance");
}

#[test]
fn admin_cancellation_waives_fee() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    scenario.advance(Duration::hours(3));
    let effects = scenario.send(BookingAction::Cancel {
        by: Actor::Admin,
        reason: "weather".to_string(),
    });

    let total: Money = assertions::refunds(&effects).iter().map(|r| r.amount).sum();
    assert_eq!(total, Money::from_cents(10_000));
}

#[test]
fn cancelling_twice_is_refused() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.send(BookingAction::Cancel {
        by: Actor::Customer,
        reason: "first".to_string(),
    });
    let effects = scenario.send(BookingAction::Cancel {
        by: Actor::Customer,
        reason: "second".to_string(),
    });

    assert_no_effects(&effects);
    assert!(matches!(scenario.error(), Some(BookingError::InvalidTransition { .. })));
}

#[test]
fn rejection_releases_worker_buffer() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let worker_id = WorkerId::new();
    scenario.assign(worker_id);

    let effects = scenario.send(BookingAction::Reject {
        reason: "duplicate booking".to_string(),
    });

    assert_eq!(scenario.state.status(), Some(BookingStatus::Rejected));
    assert_storage(&effects, &StorageOp::ReleaseBuffer { worker_id });
    assert_storage(&effects, &StorageOp::ReleaseClaim);
    assert_eq!(assertions::refunds(&effects).len(), 1);
    assert!(scenario.state.active_assignment().is_none());
}

// ============================================================================
// Assignment
// ============================================================================

#[test]
fn accepting_an_offer_reserves_the_buffer() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let worker_id = WorkerId::new();
    let assignment_id = scenario.offer(worker_id);
    let effects = scenario.send(BookingAction::AcceptAssignment { assignment_id });

    let booking = scenario.state.booking.as_ref().unwrap();
    assert_eq!(booking.status, BookingStatus::Assigned);
    assert_eq!(booking.worker_id, Some(worker_id));
    let reserve = effects.iter().find_map(|e| match e {
        Effect::Storage(StorageOp::ReserveBuffer(request)) => Some(*request),
        _ => None,
    });
    let reserve = reserve.unwrap();
    assert_eq!(reserve.worker_id, worker_id);
    assert_eq!(reserve.buffer_minutes, 30);

    // Accepting again is a no-op.
    let effects = scenario.send(BookingAction::AcceptAssignment { assignment_id });
    assert_no_effects(&effects);
    assert!(scenario.error().is_none());
}

#[test]
fn only_one_offer_at_a_time() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    scenario.offer(WorkerId::new());
    scenario.offer(WorkerId::new());

    assert!(matches!(scenario.error(), Some(BookingError::InvalidTransition { .. })));
    assert_eq!(scenario.state.assignments.len(), 1);
}

#[test]
fn rejected_offer_redispatches_excluding_worker() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let worker_id = WorkerId::new();
    let assignment_id = scenario.offer(worker_id);
    let effects = scenario.send(BookingAction::RejectAssignment {
        assignment_id,
        reason: "busy".to_string(),
    });

    assert_publishes(&effects, "assignment_rejected");
    let dispatch = assertions::dispatch(&effects).unwrap();
    assert_eq!(dispatch.excluded, vec![worker_id]);

    // The same worker cannot be offered again.
    scenario.offer(worker_id);
    assert!(matches!(scenario.error(), Some(BookingError::InvalidTransition { .. })));
}

#[test]
fn lapsed_offer_times_out_and_redispatches() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let worker_id = WorkerId::new();
    let assignment_id = scenario.offer(worker_id);

    let effects = scenario.send(BookingAction::ExpireOffer { assignment_id });
    assert_no_effects(&effects);

    scenario.advance(Duration::minutes(15));
    let effects = scenario.send(BookingAction::ExpireOffer { assignment_id });
    assert_publishes(&effects, "offer_timed_out");
    assert!(assertions::dispatch(&effects).is_some());
    assert_eq!(
        scenario.state.assignment(assignment_id).unwrap().status,
        AssignmentStatus::TimedOut
    );

    // Accepting after the timeout is refused.
    scenario.send(BookingAction::AcceptAssignment { assignment_id });
    assert!(scenario.error().is_some());
}

#[test]
fn completion_requires_the_otp() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let worker_id = WorkerId::new();
    let assignment_id = scenario.assign(worker_id);
    scenario.send(BookingAction::StartAssignment { assignment_id });
    assert_eq!(scenario.state.status(), Some(BookingStatus::InProgress));

    scenario.send(BookingAction::CompleteAssignment {
        assignment_id,
        otp: "0000".to_string(),
    });
    assert_eq!(scenario.error(), Some(&BookingError::InvalidOtp));
    assert_eq!(scenario.state.status(), Some(BookingStatus::InProgress));

    let effects = scenario.send(BookingAction::CompleteAssignment {
        assignment_id,
        otp: "4821".to_string(),
    });
    assert_eq!(scenario.state.status(), Some(BookingStatus::Completed));
    assert_storage(&effects, &StorageOp::ReleaseBuffer { worker_id });
    assert_storage(&effects, &StorageOp::ReleaseClaim);

    let effects = scenario.send(BookingAction::CompleteAssignment {
        assignment_id,
        otp: "4821".to_string(),
    });
    assert_no_effects(&effects);
    assert!(scenario.error().is_none());
}

#[test]
fn starting_requires_acceptance() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let assignment_id = scenario.offer(WorkerId::new());
    scenario.send(BookingAction::StartAssignment { assignment_id });

    assert!(matches!(scenario.error(), Some(BookingError::InvalidTransition { .. })));
    assert_eq!(scenario.state.status(), Some(BookingStatus::Confirmed));
}

#[test]
fn failed_assignment_returns_to_pool() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let worker_id = WorkerId::new();
    let assignment_id = scenario.assign(worker_id);
    let effects = scenario.send(BookingAction::FailAssignment {
        assignment_id,
        reason: "van broke down".to_string(),
    });

    let booking = scenario.state.booking.as_ref().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.worker_id, None);
    assert_storage(&effects, &StorageOp::ReleaseBuffer { worker_id });
    assert_eq!(assertions::dispatch(&effects).unwrap().excluded, vec![worker_id]);
}

#[test]
fn force_assign_replaces_current_worker() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let first = WorkerId::new();
    let second = WorkerId::new();
    scenario.assign(first);

    let effects = scenario.send(BookingAction::ForceAssign {
        assignment_id: booking_core::types::AssignmentId::new(),
        worker_id: second,
    });

    assert_storage(&effects, &StorageOp::ReleaseBuffer { worker_id: first });
    assert!(effects.iter().any(|e| matches!(
        e,
        Effect::Storage(StorageOp::ReserveBuffer(request)) if request.worker_id == second
    )));
    let active = scenario.state.active_assignment().unwrap();
    assert_eq!(active.worker_id, second);
    assert!(active.forced);
    assert_eq!(scenario.state.booking.as_ref().unwrap().worker_id, Some(second));
}

#[test]
fn exhausted_pool_marks_unassignable() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let effects = scenario.send(BookingAction::MarkUnassignable { remaining_candidates: 0 });

    assert_publishes(&effects, "booking_unassignable");
    assert!(scenario.state.booking.as_ref().unwrap().unassignable);

    // A later offer clears the flag.
    scenario.offer(WorkerId::new());
    assert!(!scenario.state.booking.as_ref().unwrap().unassignable);
}

// ============================================================================
// Refunds and notes
// ============================================================================

#[test]
fn refund_settlement_is_idempotent() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let segment_id = scenario.segment_id(0);
    let effects = scenario.send(BookingAction::RequestRefund {
        segment_id,
        amount: Some(Money::from_cents(2_500)),
    });
    assert_eq!(assertions::refunds(&effects).len(), 1);

    let settle = BookingAction::RefundSucceeded {
        segment_id,
        amount: Money::from_cents(2_500),
        refund_reference: "refund-1".to_string(),
    };
    let effects = scenario.send(settle.clone());
    assert_publishes(&effects, "refund_issued");
    assert_eq!(
        scenario.state.booking.as_ref().unwrap().payment_status,
        PaymentStatus::PartiallyRefunded
    );

    let effects = scenario.send(settle);
    assert_no_effects(&effects);
    assert_eq!(scenario.state.ledger.net_paid(), Money::from_cents(7_500));
}

#[test]
fn refund_above_refundable_is_refused() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let segment_id = scenario.segment_id(0);
    scenario.send(BookingAction::RequestRefund {
        segment_id,
        amount: Some(Money::from_cents(20_000)),
    });

    assert!(matches!(scenario.error(), Some(BookingError::PaymentMismatch { .. })));
}

#[test]
fn failed_refund_keeps_segment_paid() {
    let mut scenario = Scenario::new();
    scenario.confirm();
    let segment_id = scenario.segment_id(0);
    let effects = scenario.send(BookingAction::RefundFailed {
        segment_id,
        amount: Money::from_cents(10_000),
        reason: "gateway unavailable".to_string(),
    });

    assert_publishes(&effects, "refund_failed");
    assert_eq!(
        scenario.state.ledger.segment(segment_id).unwrap().status,
        SegmentStatus::Paid
    );
}

#[test]
fn admin_notes_are_appended() {
    let mut scenario = Scenario::new();
    scenario.hold();
    scenario.send(BookingAction::AddAdminNote {
        author: "ops".to_string(),
        note: "customer called".to_string(),
    });
    scenario.send(BookingAction::AddAdminNote {
        author: "ops".to_string(),
        note: "   ".to_string(),
    });

    assert_eq!(scenario.state.booking.as_ref().unwrap().admin_notes.len(), 1);
    assert!(matches!(scenario.error(), Some(BookingError::InvalidRequest { .. })));
}
