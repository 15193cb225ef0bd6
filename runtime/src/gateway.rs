//! Payment gateway seam.
//!
//! Charges normally complete asynchronously through the verify-payment
//! webhook; the gateway is called directly only to collect a segment at
//! booking time and to return money on refunds.

use async_trait::async_trait;
use booking_core::types::{BookingId, Money, PaymentMethod, SegmentId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Result alias for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The processor refused the charge or refund
    #[error("declined: {reason}")]
    Declined {
        /// Decline reason
        reason: String,
    },

    /// No answer within the gateway timeout
    #[error("gateway timeout")]
    Timeout,

    /// Gateway unreachable or returned a server error
    #[error("gateway unavailable: {message}")]
    Unavailable {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Whether retrying the same call may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable { .. })
    }
}

/// Payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Collects `amount` for one segment, returning the gateway reference
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the charge fails.
    async fn charge(
        &self,
        booking_id: BookingId,
        segment_id: SegmentId,
        amount: Money,
        method: PaymentMethod,
    ) -> GatewayResult<String>;

    /// Refunds part or all of an earlier payment, returning the refund reference
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the refund fails.
    async fn refund(&self, payment_reference: &str, amount: Money) -> GatewayResult<String>;
}

/// A refund the mock gateway accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRefund {
    /// Original payment reference
    pub payment_reference: String,
    /// Amount returned
    pub amount: Money,
    /// Reference handed back to the caller
    pub refund_reference: String,
}

/// Gateway that succeeds by default, for development and tests
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    decline_charges: AtomicBool,
    fail_refunds: AtomicBool,
    refunds: Mutex<Vec<RecordedRefund>>,
}

impl MockPaymentGateway {
    /// Creates a gateway that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes subsequent charges decline
    pub fn decline_charges(&self, decline: bool) {
        self.decline_charges.store(decline, Ordering::SeqCst);
    }

    /// Makes subsequent refunds fail as unavailable
    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Refunds accepted so far
    pub async fn refunds(&self) -> Vec<RecordedRefund> {
        self.refunds.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn charge(
        &self,
        booking_id: BookingId,
        segment_id: SegmentId,
        amount: Money,
        method: PaymentMethod,
    ) -> GatewayResult<String> {
        if self.decline_charges.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined {
                reason: "insufficient funds".to_string(),
            });
        }

        let transaction_id = format!("mock_txn_{}", uuid::Uuid::new_v4());
        tracing::info!(
            %booking_id,
            %segment_id,
            amount = amount.cents(),
            ?method,
            %transaction_id,
            "mock charge processed"
        );
        Ok(transaction_id)
    }

    async fn refund(&self, payment_reference: &str, amount: Money) -> GatewayResult<String> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable {
                message: "refund endpoint returned 503".to_string(),
            });
        }

        let refund_reference = format!("mock_refund_{}", uuid::Uuid::new_v4());
        tracing::info!(
            payment_reference,
            amount = amount.cents(),
            %refund_reference,
            "mock refund processed"
        );
        self.refunds.lock().await.push(RecordedRefund {
            payment_reference: payment_reference.to_string(),
            amount,
            refund_reference: refund_reference.clone(),
        });
        Ok(refund_reference)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_charge_returns_transaction_reference() {
        let gateway = MockPaymentGateway::new();
        let reference = gateway
            .charge(BookingId::new(), SegmentId::new(), Money::from_cents(2_000), PaymentMethod::Wallet)
            .await
            .unwrap();
        assert!(reference.starts_with("mock_txn_"));
    }

    #[tokio::test]
    async fn declined_charge_is_not_transient() {
        let gateway = MockPaymentGateway::new();
        gateway.decline_charges(true);
        let error = gateway
            .charge(BookingId::new(), SegmentId::new(), Money::from_cents(2_000), PaymentMethod::Gateway)
            .await
            .unwrap_err();
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn refunds_are_recorded() {
        let gateway = MockPaymentGateway::new();
        let reference = gateway.refund("txn_123", Money::from_cents(500)).await.unwrap();
        assert!(reference.starts_with("mock_refund_"));

        let refunds = gateway.refunds().await;
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].payment_reference, "txn_123");

        gateway.fail_refunds(true);
        assert!(gateway.refund("txn_123", Money::from_cents(500)).await.unwrap_err().is_transient());
    }
}
