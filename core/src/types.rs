//! Domain types for the booking engine.
//!
//! Value objects (identifiers, money, time windows) and the entities the
//! state machine owns or reads: services, workers, bookings and slot keys.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for a booking
    BookingId
);
id_type!(
    /// Unique identifier for a customer
    CustomerId
);
id_type!(
    /// Unique identifier for a bookable service
    ServiceId
);
id_type!(
    /// Unique identifier for a worker
    WorkerId
);
id_type!(
    /// Unique identifier for a slot hold
    HoldId
);
id_type!(
    /// Unique identifier for a payment segment
    SegmentId
);
id_type!(
    /// Unique identifier for a worker assignment
    AssignmentId
);
id_type!(
    /// Unique identifier for a service area
    AreaId
);

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Adds two amounts, clamping at the maximum
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Subtracts, clamping at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Returns `percent`% of this amount, rounded down
    #[must_use]
    pub const fn percent(self, percent: u32) -> Self {
        match self.0.checked_mul(percent as u64) {
            Some(product) => Self(product / 100),
            None => Self((self.0 / 100).saturating_mul(percent as u64)),
        }
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Time Windows
// ============================================================================

/// Half-open interval `[start, end)` in UTC
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window, or `None` if `end` is not after `start`
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// Window starting at `start` lasting `duration`
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>, duration: Duration) -> Option<Self> {
        Self::new(start, start + duration)
    }

    /// Length of the window
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// True if the two half-open windows share any instant
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Window padded by `buffer` on both sides
    #[must_use]
    pub fn padded(&self, buffer: Duration) -> Self {
        Self {
            start: self.start - buffer,
            end: self.end + buffer,
        }
    }

    /// Window with `buffer` appended to the end only
    #[must_use]
    pub fn with_trailing(&self, buffer: Duration) -> Self {
        Self {
            start: self.start,
            end: self.end + buffer,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

// ============================================================================
// Catalog entities (read-only to the core)
// ============================================================================

/// A bookable service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service ID
    pub id: ServiceId,
    /// Display name
    pub name: String,
    /// Estimated duration in minutes
    pub duration_minutes: i64,
    /// Total price
    pub price: Money,
    /// Inactive services cannot be booked
    pub active: bool,
}

impl Service {
    /// Estimated duration
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }
}

/// A field worker who can be dispatched to bookings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Worker ID
    pub id: WorkerId,
    /// Display name
    pub name: String,
    /// Services this worker can perform
    pub services: Vec<ServiceId>,
    /// Service areas this worker covers
    pub areas: Vec<AreaId>,
    /// Availability toggle
    pub is_available: bool,
    /// Average customer rating (0.0 - 5.0)
    pub rating: f64,
    /// When the worker last accepted an assignment
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Capable, in-area and available
    #[must_use]
    pub fn can_serve(&self, service_id: ServiceId, area_id: AreaId) -> bool {
        self.is_available && self.services.contains(&service_id) && self.areas.contains(&area_id)
    }
}

// ============================================================================
// Slot keys
// ============================================================================

/// What a slot claim is held against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotKey {
    /// A specific worker's calendar
    Worker {
        /// Worker ID
        worker_id: WorkerId,
    },
    /// Shared capacity of all eligible workers for a service in an area
    Pool {
        /// Service ID
        service_id: ServiceId,
        /// Area ID
        area_id: AreaId,
    },
}

impl SlotKey {
    /// The worker this key pins, if any
    #[must_use]
    pub const fn worker(&self) -> Option<WorkerId> {
        match self {
            Self::Worker { worker_id } => Some(*worker_id),
            Self::Pool { .. } => None,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker { worker_id } => write!(f, "worker:{worker_id}"),
            Self::Pool {
                service_id,
                area_id,
            } => write!(f, "pool:{service_id}:{area_id}"),
        }
    }
}

// ============================================================================
// Booking
// ============================================================================

/// Booking lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Slot held, nothing paid
    Held,
    /// Customer initiated payment
    PendingPayment,
    /// Every required segment paid
    Confirmed,
    /// A worker accepted the job
    Assigned,
    /// Worker started the job
    InProgress,
    /// Worker completed the job with the customer's OTP
    Completed,
    /// Rejected by an admin
    Rejected,
    /// Cancelled by customer, admin or payment timeout
    Cancelled,
    /// Hold lapsed before payment was initiated
    Expired,
}

impl BookingStatus {
    /// No further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }

    /// Still waiting on money; the hold expiry applies
    #[must_use]
    pub const fn is_awaiting_payment(self) -> bool {
        matches!(self, Self::Held | Self::PendingPayment)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate payment status derived from the ledger
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Nothing paid
    #[default]
    Unpaid,
    /// Some but not all required segments paid
    PartiallyPaid,
    /// All required segments paid
    Paid,
    /// Some money returned
    PartiallyRefunded,
    /// Everything paid has been returned
    Refunded,
}

/// How the customer pays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// External gateway; its callback confirms segments
    Gateway,
    /// In-app wallet
    Wallet,
}

/// Who initiated an action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The booking's customer
    Customer,
    /// An administrator
    Admin,
    /// Background sweep
    System,
}

/// Service address
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    /// Street address
    pub line: String,
    /// Latitude
    pub latitude: Option<f64>,
    /// Longitude
    pub longitude: Option<f64>,
}

/// Admin annotation on a booking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNote {
    /// Who wrote it
    pub author: String,
    /// Note text
    pub note: String,
    /// When it was written
    pub at: DateTime<Utc>,
}

/// The booking entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking ID
    pub id: BookingId,
    /// Customer who booked
    pub customer_id: CustomerId,
    /// Booked service
    pub service_id: ServiceId,
    /// Service area
    pub area_id: AreaId,
    /// Where the job happens
    pub address: Address,
    /// Service window (unpadded)
    pub window: TimeWindow,
    /// What the slot claim is held against
    pub slot: SlotKey,
    /// Lifecycle status
    pub status: BookingStatus,
    /// Total price
    pub total_price: Money,
    /// Derived from the ledger
    pub payment_status: PaymentStatus,
    /// Chosen payment method
    pub payment_method: Option<PaymentMethod>,
    /// Worker currently assigned
    pub worker_id: Option<WorkerId>,
    /// Worker the customer asked for
    pub preferred_worker: Option<WorkerId>,
    /// Completion code the worker must present
    pub otp: String,
    /// Admin annotations
    pub admin_notes: Vec<AdminNote>,
    /// Dispatch ran out of candidates; needs admin action
    pub unassignable: bool,
    /// Fee retained on late cancellation
    pub cancellation_fee: Option<Money>,
    /// Reason recorded on rejection or cancellation
    pub closing_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}
