//! Holds and slot claims.
//!
//! A [`Hold`] is the phase-one half of reserve-then-pay: it binds a claim
//! window to one booking until a single authoritative expiry. The store keeps
//! the matching [`SlotClaim`] row; a claim whose expiry has passed no longer
//! blocks allocation even before the sweep gets to it.

use crate::config::BookingConfig;
use crate::types::{BookingId, HoldId, PaymentMethod, SlotKey, TimeWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-boxed exclusive claim on a slot prior to payment confirmation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    /// Hold ID
    pub id: HoldId,
    /// Owning booking
    pub booking_id: BookingId,
    /// Worker or pool the slot is claimed against
    pub key: SlotKey,
    /// Claim window (service window plus trailing buffer)
    pub claim: TimeWindow,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Authoritative expiry
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    /// Places a hold lasting `booking_hold_time_minutes`
    #[must_use]
    pub fn place(
        booking_id: BookingId,
        key: SlotKey,
        claim: TimeWindow,
        now: DateTime<Utc>,
        config: &BookingConfig,
    ) -> Self {
        Self {
            id: HoldId::new(),
            booking_id,
            key,
            claim,
            created_at: now,
            expires_at: now + config.hold_time(),
        }
    }

    /// True once `now` reaches the expiry
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Expiry applied when the customer initiates payment
#[must_use]
pub fn payment_expiry(method: PaymentMethod, now: DateTime<Utc>, config: &BookingConfig) -> DateTime<Utc> {
    match method {
        PaymentMethod::Wallet => now + config.wallet_payment_timeout(),
        PaymentMethod::Gateway => now + config.gateway_payment_timeout(),
    }
}

/// Stored slot reservation row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotClaim {
    /// Owning booking
    pub booking_id: BookingId,
    /// Worker or pool the slot is claimed against
    pub key: SlotKey,
    /// Claim window
    pub window: TimeWindow,
    /// `None` once promoted to a confirmed booking
    pub expires_at: Option<DateTime<Utc>>,
}

impl SlotClaim {
    /// Claim row for a fresh hold
    #[must_use]
    pub const fn for_hold(hold: &Hold) -> Self {
        Self {
            booking_id: hold.booking_id,
            key: hold.key,
            window: hold.claim,
            expires_at: Some(hold.expires_at),
        }
    }

    /// Whether the claim still blocks allocation at `now`
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| expiry > now)
    }
}
