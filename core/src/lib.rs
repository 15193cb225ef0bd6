//! # Booking Core
//!
//! Pure domain core for the booking engine.
//!
//! This crate owns every decision the engine makes about slots, holds,
//! payment segments and worker dispatch. It performs no I/O: reducers return
//! effect descriptions, and the runtime crate executes them inside a
//! per-booking unit of work.
//!
//! ## Core Concepts
//!
//! - **State**: [`booking::BookingState`], one booking with its hold, ledger and assignments
//! - **Action**: [`booking::BookingAction`], every command the state machine accepts
//! - **Reducer**: [`booking::BookingReducer`], `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: [`effect::Effect`], storage, publish, dispatch and refund descriptions
//! - **Environment**: [`booking::BookingEnvironment`], clock plus an immutable config snapshot
//!
//! ## Example
//!
//! ```ignore
//! use booking_core::booking::{BookingAction, BookingReducer, BookingState};
//! use booking_core::reducer::Reducer;
//!
//! let mut state = BookingState::new();
//! let effects = BookingReducer::new().reduce(&mut state, BookingAction::PlaceHold { .. }, &env);
//! assert!(state.last_error.is_none());
//! ```

pub mod assignment;
pub mod booking;
pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod hold;
pub mod ledger;
pub mod slot;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

/// Reducer module - The core trait for business logic
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`.
/// They contain all business logic and are deterministic and testable.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// This is a pure function that:
        /// 1. Validates the action
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        ///
        /// A guard failure leaves the state untouched apart from recording the
        /// error, and returns no effects.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values, not execution. The runtime applies `Storage` effects
/// atomically with the state write, then publishes events and runs
/// dispatches and refunds once the unit of work has committed.
pub mod effect {
    use crate::buffer::BufferRequest;
    use crate::events::BookingEvent;
    use crate::types::{AreaId, BookingId, Money, SegmentId, ServiceId, TimeWindow, WorkerId};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type fed back into the reducer by [`Effect::Send`]
    #[derive(Clone, Debug, PartialEq)]
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Feed a follow-up action back into the reducer within the same unit of work
        Send(Box<Action>),

        /// Publish a domain event after commit
        Publish(BookingEvent),

        /// Mutate slot claims or buffer reservations atomically with the state write
        Storage(StorageOp),

        /// Ask the worker pool for the next candidate after commit
        Dispatch(DispatchRequest),

        /// Return money to the customer through the payment gateway after commit
        Refund(RefundRequest),
    }

    impl<Action> Effect<Action> {
        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Flatten nested `Sequential` effects into execution order, dropping `None`
        #[must_use]
        pub fn flatten(self) -> Vec<Effect<Action>> {
            match self {
                Effect::None => Vec::new(),
                Effect::Sequential(effects) => {
                    effects.into_iter().flat_map(Effect::flatten).collect()
                },
                other => vec![other],
            }
        }
    }

    /// Storage mutations that must commit together with the booking row.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub enum StorageOp {
        /// Drop the booking's slot claim so the window is allocatable again
        ReleaseClaim,
        /// Turn the hold's claim into a permanent claim (no expiry)
        PromoteHold,
        /// Move the claim's expiry (payment initiated)
        ExtendHold {
            /// New expiry instant
            expires_at: DateTime<Utc>,
        },
        /// Reserve a worker's padded window; fails the commit on overlap
        ReserveBuffer(BufferRequest),
        /// Release the booking's buffer for a worker
        ReleaseBuffer {
            /// Worker whose buffer is released
            worker_id: WorkerId,
        },
    }

    /// Request for the worker pool to offer the booking to the next candidate.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DispatchRequest {
        /// Booking to staff
        pub booking_id: BookingId,
        /// Required capability
        pub service_id: ServiceId,
        /// Required service area
        pub area_id: AreaId,
        /// Service window (unpadded)
        pub window: TimeWindow,
        /// Worker to try first when eligible
        pub preferred_worker: Option<WorkerId>,
        /// Workers already offered this booking
        pub excluded: Vec<WorkerId>,
    }

    /// Refund instruction for one paid segment.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RefundRequest {
        /// Booking the money belongs to
        pub booking_id: BookingId,
        /// Segment being refunded
        pub segment_id: SegmentId,
        /// Amount to return
        pub amount: Money,
        /// Gateway reference of the original payment
        pub payment_reference: String,
    }
}

/// Environment module - Dependency injection traits
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock used in production
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;

    #[test]
    fn flatten_drops_none_and_unwraps_sequences() {
        let effect: Effect<()> = Effect::chain(vec![
            Effect::None,
            Effect::Send(Box::new(())),
            Effect::chain(vec![Effect::Send(Box::new(())), Effect::None]),
        ]);

        let flat = effect.flatten();
        assert_eq!(flat.len(), 2);
        assert!(flat.iter().all(|e| matches!(e, Effect::Send(_))));
    }
}
