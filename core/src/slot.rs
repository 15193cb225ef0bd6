//! Slot allocation checks.
//!
//! [`SlotAllocator`] decides whether a requested start time is legal and
//! free. It is a pure function of the request, the config snapshot, the
//! current time and the occupied claim windows. Reserving the slot is a
//! separate step that the store performs atomically, re-running
//! [`SlotAllocator::ensure_free`] under its lock.
//!
//! Claim windows are the service window plus a trailing buffer, so two
//! claims on the same key are disjoint exactly when the jobs are at least
//! one buffer apart, whichever comes first.

use crate::config::BookingConfig;
use crate::error::{BookingError, BookingResult};
use crate::types::{SlotKey, TimeWindow};
use chrono::{DateTime, Datelike, Days, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A request to book `duration` starting at `start` against `key`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRequest {
    /// Worker or pool the slot is claimed against
    pub key: SlotKey,
    /// Requested start
    pub start: DateTime<Utc>,
    /// Service duration
    pub duration: Duration,
}

/// Proof that a slot was legal and free at check time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotToken {
    /// Worker or pool the slot is claimed against
    pub key: SlotKey,
    /// Service window
    pub window: TimeWindow,
    /// Service window plus trailing buffer
    pub claim: TimeWindow,
    /// Concurrent claims the key admits
    pub capacity: u32,
}

/// Pure slot legality and availability checks
#[derive(Clone, Copy, Debug, Default)]
pub struct SlotAllocator;

impl SlotAllocator {
    /// Validates the request against the calendar rules.
    ///
    /// Returns the service window and the claim window.
    ///
    /// # Errors
    ///
    /// `StartInPast`, `TooFarInAdvance` or `OutsideWorkingHours`; an empty
    /// duration is an `InvalidRequest`.
    pub fn validate(
        request: &SlotRequest,
        config: &BookingConfig,
        now: DateTime<Utc>,
    ) -> BookingResult<(TimeWindow, TimeWindow)> {
        let window = TimeWindow::starting_at(request.start, request.duration)
            .ok_or_else(|| BookingError::invalid("service duration must be positive"))?;

        if window.start < now {
            return Err(BookingError::StartInPast { start: window.start });
        }

        let tz = config.timezone();
        let local_start = window.start.with_timezone(&tz);
        let local_end = window.end.with_timezone(&tz);

        let today = now.with_timezone(&tz).date_naive();
        let horizon = u64::try_from(config.booking_advance_days).unwrap_or(0);
        let latest = today.checked_add_days(Days::new(horizon)).unwrap_or(today);
        if local_start.date_naive() > latest {
            return Err(BookingError::TooFarInAdvance {
                start: window.start,
                latest,
            });
        }

        let same_day = local_start.date_naive() == local_end.date_naive();
        let working_day = config.working_days.contains(&local_start.weekday());
        let within_hours = local_start.time() >= config.working_hours_start
            && local_end.time() <= config.working_hours_end;
        if !(same_day && working_day && within_hours) {
            return Err(BookingError::OutsideWorkingHours { window });
        }

        Ok((window, window.with_trailing(config.buffer())))
    }

    /// Fails with `SlotConflict` when `claim` would exceed `capacity`.
    ///
    /// # Errors
    ///
    /// `SlotConflict` carrying the first overlapping window and the count.
    pub fn ensure_free(claim: &TimeWindow, capacity: u32, occupied: &[TimeWindow]) -> BookingResult<()> {
        let overlapping: Vec<&TimeWindow> = occupied.iter().filter(|w| w.overlaps(claim)).collect();
        let cap = usize::try_from(capacity).unwrap_or(usize::MAX);
        if overlapping.len() >= cap {
            return Err(BookingError::SlotConflict {
                window: *claim,
                conflicting: overlapping.first().map(|w| **w),
                occupied: overlapping.len(),
                capacity,
            });
        }
        Ok(())
    }

    /// Full check: calendar rules plus availability.
    ///
    /// # Errors
    ///
    /// Any error of [`Self::validate`] or [`Self::ensure_free`].
    pub fn check(
        request: &SlotRequest,
        config: &BookingConfig,
        now: DateTime<Utc>,
        capacity: u32,
        occupied: &[TimeWindow],
    ) -> BookingResult<SlotToken> {
        let (window, claim) = Self::validate(request, config, now)?;
        Self::ensure_free(&claim, capacity, occupied)?;
        Ok(SlotToken {
            key: request.key,
            window,
            claim,
            capacity,
        })
    }
}
