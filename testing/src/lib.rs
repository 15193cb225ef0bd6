//! # Booking Testing
//!
//! Testing utilities and helpers for the booking engine.
//!
//! This crate provides:
//! - Deterministic clocks
//! - A scenario builder that drives the booking reducer through its lifecycle
//! - Property-based testing strategies
//! - The Given-When-Then reducer harness and effect assertions
//!
//! ## Example
//!
//! ```ignore
//! use booking_testing::fixtures::Scenario;
//!
//! let mut scenario = Scenario::new();
//! scenario.confirm();
//! let assignment = scenario.assign(WorkerId::new());
//! assert_eq!(scenario.state.status(), Some(BookingStatus::Assigned));
//! ```

use booking_core::environment::Clock;
use chrono::{DateTime, Utc};

mod reducer_test;

pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock that only moves when told to
    ///
    /// Shared between the test and the environment so expiry paths can be
    /// exercised without sleeping.
    ///
    /// # Example
    ///
    /// ```
    /// use booking_testing::mocks::{ManualClock, test_time};
    /// use booking_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::new(test_time());
    /// assert_eq!(clock.now(), clock.now());
    /// clock.advance(Duration::minutes(10));
    /// assert_eq!(clock.now(), test_time() + Duration::minutes(10));
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        millis: AtomicI64,
    }

    impl ManualClock {
        /// Starts the clock at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                millis: AtomicI64::new(time.timestamp_millis()),
            }
        }

        /// Moves the clock forward
        pub fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }

        /// Jumps to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
        }
    }

    /// Monday 2025-01-06 08:00 UTC, an hour before opening
    #[must_use]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_736_150_400, 0).unwrap_or_default()
    }
}

/// Scenario builders for booking tests
pub mod fixtures {
    use super::mocks::{ManualClock, test_time};
    use booking_core::booking::{BookingAction, BookingEnvironment, BookingReducer, BookingState};
    use booking_core::config::BookingConfig;
    use booking_core::effect::Effect;
    use booking_core::error::BookingError;
    use booking_core::ledger::SegmentSpec;
    use booking_core::reducer::Reducer;
    use booking_core::slot::SlotToken;
    use booking_core::types::{
        Address, AreaId, AssignmentId, BookingId, CustomerId, Money, SegmentId, Service, ServiceId, SlotKey,
        TimeWindow, Worker, WorkerId,
    };
    use chrono::{DateTime, Duration, Utc};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Two-hour cleaning at 100.00
    #[must_use]
    pub fn service() -> Service {
        Service {
            id: ServiceId::new(),
            name: "Deep cleaning".to_string(),
            duration_minutes: 120,
            price: Money::from_cents(10_000),
            active: true,
        }
    }

    /// Available worker for `service` in `area`
    #[must_use]
    pub fn worker(name: &str, service_id: ServiceId, area_id: AreaId, rating: f64) -> Worker {
        Worker {
            id: WorkerId::new(),
            name: name.to_string(),
            services: vec![service_id],
            areas: vec![area_id],
            is_available: true,
            rating,
            last_assigned_at: None,
        }
    }

    /// Tuesday 2025-01-07 at `hour`:00 UTC
    #[must_use]
    pub fn tuesday(hour: i64) -> DateTime<Utc> {
        test_time() + Duration::days(1) + Duration::hours(hour - 8)
    }

    /// Deposit then balance, both required
    #[must_use]
    pub fn deposit_plan(deposit: u64, balance: u64) -> Vec<SegmentSpec> {
        vec![
            SegmentSpec {
                label: "deposit".to_string(),
                amount: Money::from_cents(deposit),
                required: true,
            },
            SegmentSpec {
                label: "balance".to_string(),
                amount: Money::from_cents(balance),
                required: true,
            },
        ]
    }

    /// Drives one booking through the reducer on a manual clock
    pub struct Scenario {
        /// Reducer under test
        pub reducer: BookingReducer,
        /// Shared clock
        pub clock: Arc<ManualClock>,
        /// Environment handed to the reducer
        pub env: BookingEnvironment,
        /// Current state
        pub state: BookingState,
        /// Service being booked
        pub service: Service,
        /// Service area
        pub area_id: AreaId,
        /// Booking ID used by `hold`
        pub booking_id: BookingId,
        /// Customer ID used by `hold`
        pub customer_id: CustomerId,
    }

    impl Default for Scenario {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Scenario {
        /// Default configuration, clock at Monday 08:00 UTC
        #[must_use]
        pub fn new() -> Self {
            Self::with_config(BookingConfig::default())
        }

        /// Custom configuration
        #[must_use]
        pub fn with_config(config: BookingConfig) -> Self {
            let clock = Arc::new(ManualClock::new(test_time()));
            let env = BookingEnvironment::new(clock.clone(), Arc::new(config));
            Self {
                reducer: BookingReducer::new(),
                clock,
                env,
                state: BookingState::new(),
                service: service(),
                area_id: AreaId::new(),
                booking_id: BookingId::new(),
                customer_id: CustomerId::new(),
            }
        }

        /// Current clock time
        #[must_use]
        pub fn now(&self) -> DateTime<Utc> {
            self.env.clock.now()
        }

        /// Moves the clock forward
        pub fn advance(&self, by: Duration) {
            self.clock.advance(by);
        }

        /// Applies one action and returns its flattened effects
        pub fn send(&mut self, action: BookingAction) -> Vec<Effect<BookingAction>> {
            self.reducer
                .reduce(&mut self.state, action, &self.env)
                .into_iter()
                .flat_map(Effect::flatten)
                .collect()
        }

        /// Applies an action and any follow-up actions it sends, returning
        /// every other effect in order
        pub fn send_all(&mut self, action: BookingAction) -> Vec<Effect<BookingAction>> {
            let mut queue = VecDeque::from([action]);
            let mut effects = Vec::new();
            while let Some(next) = queue.pop_front() {
                for effect in self.send(next) {
                    match effect {
                        Effect::Send(action) => queue.push_back(*action),
                        other => effects.push(other),
                    }
                }
            }
            effects
        }

        /// Guard failure from the last action
        #[must_use]
        pub fn error(&self) -> Option<&BookingError> {
            self.state.last_error.as_ref()
        }

        /// Slot token for the service starting at `start` on the area pool
        #[must_use]
        pub fn token(&self, start: DateTime<Utc>) -> SlotToken {
            let window = TimeWindow::new(start, start + self.service.duration()).unwrap_or(TimeWindow {
                start,
                end: start + Duration::minutes(1),
            });
            SlotToken {
                key: SlotKey::Pool {
                    service_id: self.service.id,
                    area_id: self.area_id,
                },
                window,
                claim: window.with_trailing(self.env.config.buffer()),
                capacity: 3,
            }
        }

        /// `PlaceHold` for Tuesday 10:00 with the given plan
        #[must_use]
        pub fn place_hold_action(&self, segments: Vec<SegmentSpec>) -> BookingAction {
            BookingAction::PlaceHold {
                booking_id: self.booking_id,
                customer_id: self.customer_id,
                service: self.service.clone(),
                area_id: self.area_id,
                address: Address {
                    line: "12 Harbour Road".to_string(),
                    latitude: None,
                    longitude: None,
                },
                slot: self.token(tuesday(10)),
                preferred_worker: None,
                segments,
                otp: "4821".to_string(),
            }
        }

        /// Holds Tuesday 10:00 with a single full-payment segment
        pub fn hold(&mut self) -> Vec<Effect<BookingAction>> {
            self.hold_with_segments(Vec::new())
        }

        /// Holds Tuesday 10:00 with the given plan
        pub fn hold_with_segments(&mut self, segments: Vec<SegmentSpec>) -> Vec<Effect<BookingAction>> {
            let action = self.place_hold_action(segments);
            self.send(action)
        }

        /// Segment ID by plan position
        #[must_use]
        pub fn segment_id(&self, index: usize) -> SegmentId {
            self.state
                .ledger
                .segments
                .get(index)
                .map_or_else(SegmentId::new, |s| s.id)
        }

        /// Pays the segment at `index` in full
        pub fn pay(&mut self, index: usize, reference: &str) -> Vec<Effect<BookingAction>> {
            let segment_id = self.segment_id(index);
            let amount = self
                .state
                .ledger
                .segment(segment_id)
                .map_or(Money::ZERO, |s| s.amount);
            self.send_all(BookingAction::PaySegment {
                segment_id,
                amount,
                reference: reference.to_string(),
            })
        }

        /// Holds and pays in full
        pub fn confirm(&mut self) -> Vec<Effect<BookingAction>> {
            self.hold();
            self.pay(0, "pay-full")
        }

        /// Offers the booking to `worker_id`
        pub fn offer(&mut self, worker_id: WorkerId) -> AssignmentId {
            let assignment_id = AssignmentId::new();
            self.send(BookingAction::OfferWorker {
                assignment_id,
                worker_id,
            });
            assignment_id
        }

        /// Offers and accepts
        pub fn assign(&mut self, worker_id: WorkerId) -> AssignmentId {
            let assignment_id = self.offer(worker_id);
            self.send(BookingAction::AcceptAssignment { assignment_id });
            assignment_id
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use booking_core::ledger::SegmentSpec;
    use booking_core::types::Money;
    use proptest::prelude::*;

    /// Splits `total` cents into one to four positive required segments
    pub fn segment_plan(total: u64) -> impl Strategy<Value = Vec<SegmentSpec>> {
        proptest::collection::vec(1u64..=100, 1..=4).prop_map(move |weights| {
            let sum: u64 = weights.iter().sum();
            let mut remaining = total;
            let count = weights.len();
            weights
                .iter()
                .enumerate()
                .map(|(index, weight)| {
                    let amount = if index + 1 == count {
                        remaining
                    } else {
                        (total * weight / sum).clamp(1, remaining.saturating_sub((count - index - 1) as u64))
                    };
                    remaining -= amount;
                    SegmentSpec {
                        label: format!("part-{index}"),
                        amount: Money::from_cents(amount),
                        required: true,
                    }
                })
                .collect()
        })
    }
}

/// Installs a test-writer `tracing` subscriber; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{ManualClock, test_time};
