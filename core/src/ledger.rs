//! Payment segment ledger.
//!
//! A booking declares its segments up front (commonly one, sometimes a
//! deposit and a balance). Segments move `pending → paid`, with `failed`
//! as a retryable side state. Money only leaves `paid` through an explicit
//! refund, which is recorded as its own ledger entry. Payment handling is
//! idempotent on the gateway reference.

use crate::effect::RefundRequest;
use crate::error::{BookingError, BookingResult};
use crate::types::{BookingId, Money, PaymentStatus, SegmentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Requested segment when planning a booking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    /// Display label, e.g. "deposit"
    pub label: String,
    /// Amount due
    pub amount: Money,
    /// Whether the booking needs it to be confirmed
    #[serde(default = "default_required")]
    pub required: bool,
}

const fn default_required() -> bool {
    true
}

/// Segment state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    /// Awaiting payment
    Pending,
    /// Paid in full
    Paid,
    /// Last attempt failed; may be retried
    Failed,
    /// Fully refunded
    Refunded,
}

/// One partial payment obligation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSegment {
    /// Segment ID
    pub id: SegmentId,
    /// Order within the booking, starting at 1
    pub sequence: u32,
    /// Display label
    pub label: String,
    /// Amount due
    pub amount: Money,
    /// Required for confirmation
    pub required: bool,
    /// Current state
    pub status: SegmentStatus,
    /// Payment attempts seen
    pub attempts: u32,
    /// Gateway reference of the successful payment
    pub reference: Option<String>,
    /// When it was paid
    pub paid_at: Option<DateTime<Utc>>,
    /// Money already returned
    pub refunded_amount: Money,
}

impl PaymentSegment {
    /// Paid money not yet returned
    #[must_use]
    pub fn refundable(&self) -> Money {
        match self.status {
            SegmentStatus::Paid => self.amount.saturating_sub(self.refunded_amount),
            _ => Money::ZERO,
        }
    }
}

/// Kind of audited ledger movement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    /// Money received
    Payment,
    /// Payment attempt failed
    PaymentFailed,
    /// Money returned
    Refund,
    /// Refund attempt failed; money still held
    RefundFailed,
    /// Late-cancellation fee retained
    CancellationFee,
}

/// Audited ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Movement kind
    pub kind: LedgerEntryKind,
    /// Segment concerned, if any
    pub segment_id: Option<SegmentId>,
    /// Amount moved (or attempted)
    pub amount: Money,
    /// Gateway reference
    pub reference: Option<String>,
    /// Free-form detail
    pub note: Option<String>,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect on the customer's balance with the business, in cents
    #[must_use]
    pub fn signed_cents(&self) -> i128 {
        let cents = i128::from(self.amount.cents());
        match self.kind {
            LedgerEntryKind::Payment => cents,
            LedgerEntryKind::Refund | LedgerEntryKind::CancellationFee => -cents,
            LedgerEntryKind::PaymentFailed | LedgerEntryKind::RefundFailed => 0,
        }
    }
}

/// Result of a successful segment payment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayOutcome {
    /// This payment completed the last required segment
    pub newly_funded: bool,
}

/// Segments and audit trail of one booking
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentLedger {
    /// Segments in due order
    pub segments: Vec<PaymentSegment>,
    /// Audit trail
    pub entries: Vec<LedgerEntry>,
    /// Payment and refund references already applied
    pub processed_references: BTreeSet<String>,
}

impl SegmentLedger {
    /// Plans segments for a booking priced at `total`.
    ///
    /// An empty plan yields one required segment for the full amount.
    ///
    /// # Errors
    ///
    /// `PaymentMismatch` when the segments do not add up to `total`;
    /// `InvalidRequest` for a zero-amount segment or an optional-only plan.
    pub fn plan(total: Money, specs: &[SegmentSpec]) -> BookingResult<Self> {
        if specs.is_empty() {
            return Ok(Self::from_specs(&[SegmentSpec {
                label: "full".to_string(),
                amount: total,
                required: true,
            }]));
        }

        if specs.iter().any(|s| s.amount.is_zero()) {
            return Err(BookingError::invalid("payment segments must be non-zero"));
        }
        if !specs.iter().any(|s| s.required) {
            return Err(BookingError::invalid("at least one payment segment must be required"));
        }

        let sum: Money = specs.iter().map(|s| s.amount).sum();
        if sum != total {
            return Err(BookingError::PaymentMismatch {
                expected: total,
                received: sum,
            });
        }

        Ok(Self::from_specs(specs))
    }

    fn from_specs(specs: &[SegmentSpec]) -> Self {
        let segments = specs
            .iter()
            .zip(1u32..)
            .map(|(spec, sequence)| PaymentSegment {
                id: SegmentId::new(),
                sequence,
                label: spec.label.clone(),
                amount: spec.amount,
                required: spec.required,
                status: SegmentStatus::Pending,
                attempts: 0,
                reference: None,
                paid_at: None,
                refunded_amount: Money::ZERO,
            })
            .collect();
        Self {
            segments,
            ..Self::default()
        }
    }

    /// Looks a segment up
    #[must_use]
    pub fn segment(&self, id: SegmentId) -> Option<&PaymentSegment> {
        self.segments.iter().find(|s| s.id == id)
    }

    fn segment_mut(&mut self, id: SegmentId) -> BookingResult<&mut PaymentSegment> {
        self.segments
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| BookingError::not_found("segment", id))
    }

    /// Whether a reference was already applied
    #[must_use]
    pub fn has_processed(&self, reference: &str) -> bool {
        self.processed_references.contains(reference)
    }

    /// Checks a payment without applying it.
    ///
    /// # Errors
    ///
    /// See [`Self::pay`].
    pub fn check_payment(&self, id: SegmentId, amount: Money, reference: &str) -> BookingResult<()> {
        if self.has_processed(reference) {
            return Err(BookingError::DuplicateWebhook {
                reference: reference.to_string(),
            });
        }
        let segment = self.segment(id).ok_or_else(|| BookingError::not_found("segment", id))?;
        match segment.status {
            SegmentStatus::Pending | SegmentStatus::Failed => {},
            SegmentStatus::Paid | SegmentStatus::Refunded => {
                return Err(BookingError::transition(
                    format!("segment {} is {:?}", segment.sequence, segment.status).to_lowercase(),
                    "pay segment",
                ));
            },
        }
        if amount != segment.amount {
            return Err(BookingError::PaymentMismatch {
                expected: segment.amount,
                received: amount,
            });
        }
        Ok(())
    }

    /// Marks a segment paid. Segments may be paid in any order.
    ///
    /// # Errors
    ///
    /// `DuplicateWebhook` for an already applied reference, `NotFound` for an
    /// unknown segment, `InvalidTransition` for a paid or refunded segment and
    /// `PaymentMismatch` when the amount differs from what is due.
    pub fn pay(&mut self, id: SegmentId, amount: Money, reference: &str, now: DateTime<Utc>) -> BookingResult<PayOutcome> {
        self.check_payment(id, amount, reference)?;
        let was_funded = self.is_fully_funded();

        let segment = self.segment_mut(id)?;
        segment.status = SegmentStatus::Paid;
        segment.attempts += 1;
        segment.reference = Some(reference.to_string());
        segment.paid_at = Some(now);

        self.processed_references.insert(reference.to_string());
        self.entries.push(LedgerEntry {
            kind: LedgerEntryKind::Payment,
            segment_id: Some(id),
            amount,
            reference: Some(reference.to_string()),
            note: None,
            at: now,
        });

        Ok(PayOutcome {
            newly_funded: !was_funded && self.is_fully_funded(),
        })
    }

    /// Records a failed attempt. A paid segment is left untouched.
    ///
    /// Returns whether the segment changed.
    ///
    /// # Errors
    ///
    /// `DuplicateWebhook` for an already applied reference, `NotFound` for an
    /// unknown segment.
    pub fn fail(
        &mut self,
        id: SegmentId,
        reason: &str,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> BookingResult<bool> {
        if let Some(reference) = reference {
            if self.has_processed(reference) {
                return Err(BookingError::DuplicateWebhook {
                    reference: reference.to_string(),
                });
            }
        }

        let segment = self.segment_mut(id)?;
        if !matches!(segment.status, SegmentStatus::Pending | SegmentStatus::Failed) {
            return Ok(false);
        }
        segment.status = SegmentStatus::Failed;
        segment.attempts += 1;
        let amount = segment.amount;

        if let Some(reference) = reference {
            self.processed_references.insert(reference.to_string());
        }
        self.entries.push(LedgerEntry {
            kind: LedgerEntryKind::PaymentFailed,
            segment_id: Some(id),
            amount,
            reference: reference.map(str::to_string),
            note: Some(reason.to_string()),
            at: now,
        });
        Ok(true)
    }

    /// All required segments are paid
    #[must_use]
    pub fn is_fully_funded(&self) -> bool {
        self.segments
            .iter()
            .filter(|s| s.required)
            .all(|s| s.status == SegmentStatus::Paid)
    }

    /// Money received and not returned
    #[must_use]
    pub fn net_paid(&self) -> Money {
        self.segments.iter().map(PaymentSegment::refundable).sum()
    }

    /// Aggregate payment status
    #[must_use]
    pub fn payment_status(&self) -> PaymentStatus {
        let refunded: Money = self.segments.iter().map(|s| s.refunded_amount).sum();
        let any_paid = self.segments.iter().any(|s| s.status == SegmentStatus::Paid);
        if !refunded.is_zero() {
            if any_paid && !self.net_paid().is_zero() {
                PaymentStatus::PartiallyRefunded
            } else {
                PaymentStatus::Refunded
            }
        } else if self.is_fully_funded() {
            PaymentStatus::Paid
        } else if any_paid {
            PaymentStatus::PartiallyPaid
        } else {
            PaymentStatus::Unpaid
        }
    }

    /// Refunds returning everything paid except `retain`, latest segment first
    #[must_use]
    pub fn refund_plan(&self, booking_id: BookingId, retain: Money) -> Vec<RefundRequest> {
        let mut to_refund = self.net_paid().saturating_sub(retain);
        let mut plan = Vec::new();
        for segment in self.segments.iter().rev() {
            if to_refund.is_zero() {
                break;
            }
            let refundable = segment.refundable();
            if refundable.is_zero() {
                continue;
            }
            let Some(reference) = segment.reference.clone() else {
                continue;
            };
            let amount = refundable.min(to_refund);
            to_refund = to_refund.saturating_sub(amount);
            plan.push(RefundRequest {
                booking_id,
                segment_id: segment.id,
                amount,
                payment_reference: reference,
            });
        }
        plan
    }

    /// Checks a manual refund request against what is refundable.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown segment, `InvalidTransition` if nothing is
    /// refundable, `PaymentMismatch` if `amount` exceeds what is refundable.
    pub fn refund_request(
        &self,
        booking_id: BookingId,
        id: SegmentId,
        amount: Option<Money>,
    ) -> BookingResult<RefundRequest> {
        let segment = self.segment(id).ok_or_else(|| BookingError::not_found("segment", id))?;
        let refundable = segment.refundable();
        let reference = match (&segment.reference, refundable.is_zero()) {
            (Some(reference), false) => reference.clone(),
            _ => return Err(BookingError::transition("segment has nothing refundable", "refund")),
        };
        let amount = amount.unwrap_or(refundable);
        if amount.is_zero() || amount > refundable {
            return Err(BookingError::PaymentMismatch {
                expected: refundable,
                received: amount,
            });
        }
        Ok(RefundRequest {
            booking_id,
            segment_id: id,
            amount,
            payment_reference: reference,
        })
    }

    /// Records a completed refund. Idempotent on the refund reference.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown segment.
    pub fn record_refund(
        &mut self,
        id: SegmentId,
        amount: Money,
        refund_reference: &str,
        now: DateTime<Utc>,
    ) -> BookingResult<bool> {
        if self.has_processed(refund_reference) {
            return Ok(false);
        }
        let segment = self.segment_mut(id)?;
        let applied = amount.min(segment.refundable());
        segment.refunded_amount = segment.refunded_amount.saturating_add(applied);
        if segment.refunded_amount >= segment.amount {
            segment.status = SegmentStatus::Refunded;
        }

        self.processed_references.insert(refund_reference.to_string());
        self.entries.push(LedgerEntry {
            kind: LedgerEntryKind::Refund,
            segment_id: Some(id),
            amount: applied,
            reference: Some(refund_reference.to_string()),
            note: None,
            at: now,
        });
        Ok(true)
    }

    /// Records a failed refund attempt; the segment stays `paid`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown segment.
    pub fn record_refund_failure(
        &mut self,
        id: SegmentId,
        amount: Money,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BookingResult<()> {
        self.segment(id).ok_or_else(|| BookingError::not_found("segment", id))?;
        self.entries.push(LedgerEntry {
            kind: LedgerEntryKind::RefundFailed,
            segment_id: Some(id),
            amount,
            reference: None,
            note: Some(reason.to_string()),
            at: now,
        });
        Ok(())
    }

    /// Records a retained cancellation fee
    pub fn charge_fee(&mut self, fee: Money, now: DateTime<Utc>) {
        self.entries.push(LedgerEntry {
            kind: LedgerEntryKind::CancellationFee,
            segment_id: None,
            amount: fee,
            reference: None,
            note: Some("late cancellation".to_string()),
            at: now,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()
    }

    fn deposit_and_balance() -> SegmentLedger {
        SegmentLedger::plan(
            Money::from_cents(1000),
            &[
                SegmentSpec {
                    label: "deposit".into(),
                    amount: Money::from_cents(200),
                    required: true,
                },
                SegmentSpec {
                    label: "balance".into(),
                    amount: Money::from_cents(800),
                    required: true,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn empty_plan_is_single_full_segment() {
        let ledger = SegmentLedger::plan(Money::from_cents(500), &[]).unwrap();
        assert_eq!(ledger.segments.len(), 1);
        assert_eq!(ledger.segments[0].amount, Money::from_cents(500));
        assert!(ledger.segments[0].required);
    }

    #[test]
    fn plan_must_add_up() {
        let result = SegmentLedger::plan(
            Money::from_cents(1000),
            &[SegmentSpec {
                label: "deposit".into(),
                amount: Money::from_cents(200),
                required: true,
            }],
        );
        assert!(matches!(result, Err(BookingError::PaymentMismatch { .. })));
    }

    #[test]
    fn funded_only_after_both_segments() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        let balance = ledger.segments[1].id;

        let first = ledger.pay(balance, Money::from_cents(800), "pay_b", now()).unwrap();
        assert!(!first.newly_funded);
        assert_eq!(ledger.payment_status(), PaymentStatus::PartiallyPaid);

        let second = ledger.pay(deposit, Money::from_cents(200), "pay_d", now()).unwrap();
        assert!(second.newly_funded);
        assert_eq!(ledger.payment_status(), PaymentStatus::Paid);
    }

    #[test]
    fn duplicate_reference_is_rejected_once_applied() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        ledger.pay(deposit, Money::from_cents(200), "pay_1", now()).unwrap();
        let again = ledger.pay(deposit, Money::from_cents(200), "pay_1", now());
        assert!(matches!(again, Err(BookingError::DuplicateWebhook { .. })));
        assert_eq!(ledger.entries.len(), 1);
    }

    #[test]
    fn wrong_amount_is_a_mismatch() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        let result = ledger.pay(deposit, Money::from_cents(199), "pay_1", now());
        assert!(matches!(result, Err(BookingError::PaymentMismatch { .. })));
        assert_eq!(ledger.segments[0].status, SegmentStatus::Pending);
    }

    #[test]
    fn failure_allows_retry_and_never_unpays() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        assert!(ledger.fail(deposit, "card declined", Some("pay_x"), now()).unwrap());
        assert_eq!(ledger.segments[0].status, SegmentStatus::Failed);

        ledger.pay(deposit, Money::from_cents(200), "pay_y", now()).unwrap();
        assert!(!ledger.fail(deposit, "late failure", None, now()).unwrap());
        assert_eq!(ledger.segments[0].status, SegmentStatus::Paid);
        assert_eq!(ledger.segments[0].attempts, 2);
    }

    #[test]
    fn refund_plan_retains_fee_from_latest_segment() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        let balance = ledger.segments[1].id;
        ledger.pay(deposit, Money::from_cents(200), "pay_d", now()).unwrap();
        ledger.pay(balance, Money::from_cents(800), "pay_b", now()).unwrap();

        let plan = ledger.refund_plan(BookingId::new(), Money::from_cents(100));
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].segment_id, balance);
        assert_eq!(plan[0].amount, Money::from_cents(800));
        assert_eq!(plan[1].segment_id, deposit);
        assert_eq!(plan[1].amount, Money::from_cents(100));
    }

    #[test]
    fn refund_failure_leaves_segment_paid() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        ledger.pay(deposit, Money::from_cents(200), "pay_d", now()).unwrap();
        ledger
            .record_refund_failure(deposit, Money::from_cents(200), "gateway down", now())
            .unwrap();
        assert_eq!(ledger.segments[0].status, SegmentStatus::Paid);
        assert_eq!(ledger.entries.last().unwrap().kind, LedgerEntryKind::RefundFailed);

        assert!(ledger.record_refund(deposit, Money::from_cents(200), "rf_1", now()).unwrap());
        assert!(!ledger.record_refund(deposit, Money::from_cents(200), "rf_1", now()).unwrap());
        assert_eq!(ledger.segments[0].status, SegmentStatus::Refunded);
        assert_eq!(ledger.payment_status(), PaymentStatus::Refunded);
    }

    #[test]
    fn manual_refund_cannot_exceed_refundable() {
        let mut ledger = deposit_and_balance();
        let deposit = ledger.segments[0].id;
        assert!(ledger.refund_request(BookingId::new(), deposit, None).is_err());
        ledger.pay(deposit, Money::from_cents(200), "pay_d", now()).unwrap();
        assert!(
            ledger
                .refund_request(BookingId::new(), deposit, Some(Money::from_cents(201)))
                .is_err()
        );
        let request = ledger.refund_request(BookingId::new(), deposit, None).unwrap();
        assert_eq!(request.amount, Money::from_cents(200));
    }

    proptest! {
        #[test]
        fn never_funded_with_unpaid_required_segment(order in proptest::collection::vec(0usize..3, 0..6)) {
            let mut ledger = SegmentLedger::plan(
                Money::from_cents(600),
                &[
                    SegmentSpec { label: "a".into(), amount: Money::from_cents(100), required: true },
                    SegmentSpec { label: "b".into(), amount: Money::from_cents(200), required: true },
                    SegmentSpec { label: "c".into(), amount: Money::from_cents(300), required: false },
                ],
            ).unwrap();
            for (n, idx) in order.into_iter().enumerate() {
                let segment = ledger.segments[idx].clone();
                let _ = ledger.pay(segment.id, segment.amount, &format!("ref_{n}"), now());
            }
            let required_paid = ledger
                .segments
                .iter()
                .filter(|s| s.required)
                .all(|s| s.status == SegmentStatus::Paid);
            prop_assert_eq!(ledger.is_fully_funded(), required_paid);
        }
    }
}
