//! Worker assignment lifecycle and candidate ranking.
//!
//! An assignment binds one worker to one booking for one lifecycle:
//! `offered → accepted | rejected | timed_out`, then `accepted → started →
//! completed | failed`. Ranking among eligible candidates is isolated behind
//! [`CandidateRanking`] so the policy can change without touching the
//! offer/timeout state machine.

use crate::error::{BookingError, BookingResult};
use crate::types::{AssignmentId, BookingId, WorkerId, Worker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Assignment state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Waiting for the worker to respond
    Offered,
    /// Worker accepted
    Accepted,
    /// Worker declined
    Rejected,
    /// Worker did not respond in time
    TimedOut,
    /// Worker is on the job
    Started,
    /// Job finished
    Completed,
    /// Worker could not finish
    Failed,
    /// Withdrawn because the booking closed or was reassigned
    Cancelled,
}

impl AssignmentStatus {
    /// Non-terminal states
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Offered | Self::Accepted | Self::Started)
    }

    /// Holds a buffer reservation
    #[must_use]
    pub const fn holds_buffer(self) -> bool {
        matches!(self, Self::Accepted | Self::Started)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offered => "offered",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One worker's lifecycle on one booking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    /// Assignment ID
    pub id: AssignmentId,
    /// Booking being staffed
    pub booking_id: BookingId,
    /// Worker offered the job
    pub worker_id: WorkerId,
    /// Current state
    pub status: AssignmentStatus,
    /// Created by an admin override rather than the pool
    pub forced: bool,
    /// When the offer was made
    pub offered_at: DateTime<Utc>,
    /// Acceptance deadline
    pub offer_expires_at: Option<DateTime<Utc>>,
    /// When the worker accepted
    pub accepted_at: Option<DateTime<Utc>>,
    /// When work started
    pub started_at: Option<DateTime<Utc>>,
    /// When the assignment reached a terminal state
    pub closed_at: Option<DateTime<Utc>>,
    /// Reason given on reject, fail or cancel
    pub reason: Option<String>,
}

impl WorkerAssignment {
    /// New pending offer
    #[must_use]
    pub const fn offer(
        id: AssignmentId,
        booking_id: BookingId,
        worker_id: WorkerId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            booking_id,
            worker_id,
            status: AssignmentStatus::Offered,
            forced: false,
            offered_at: now,
            offer_expires_at: Some(expires_at),
            accepted_at: None,
            started_at: None,
            closed_at: None,
            reason: None,
        }
    }

    /// Admin override: accepted on creation
    #[must_use]
    pub const fn forced(id: AssignmentId, booking_id: BookingId, worker_id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            booking_id,
            worker_id,
            status: AssignmentStatus::Accepted,
            forced: true,
            offered_at: now,
            offer_expires_at: None,
            accepted_at: Some(now),
            started_at: None,
            closed_at: None,
            reason: None,
        }
    }

    /// Offer deadline has passed
    #[must_use]
    pub fn offer_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == AssignmentStatus::Offered && self.offer_expires_at.is_some_and(|deadline| now >= deadline)
    }

    fn guard(&self, allowed: &[AssignmentStatus], action: &str) -> BookingResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(BookingError::transition(format!("assignment is {}", self.status.as_str()), action))
        }
    }

    /// Validates an accept; `Ok(false)` when already accepted
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless offered (and not lapsed) or already accepted.
    pub fn can_accept(&self, now: DateTime<Utc>) -> BookingResult<bool> {
        if self.status == AssignmentStatus::Accepted {
            return Ok(false);
        }
        self.guard(&[AssignmentStatus::Offered], "accept")?;
        if self.offer_lapsed(now) {
            return Err(BookingError::transition("offer has lapsed", "accept"));
        }
        Ok(true)
    }

    /// Validates a start; `Ok(false)` when already started
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless accepted or already started.
    pub fn can_start(&self) -> BookingResult<bool> {
        if self.status == AssignmentStatus::Started {
            return Ok(false);
        }
        self.guard(&[AssignmentStatus::Accepted], "start")?;
        Ok(true)
    }

    /// Validates a complete; `Ok(false)` when already completed
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless started or already completed.
    pub fn can_complete(&self) -> BookingResult<bool> {
        if self.status == AssignmentStatus::Completed {
            return Ok(false);
        }
        self.guard(&[AssignmentStatus::Started], "complete")?;
        Ok(true)
    }

    /// Validates a reject
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless offered or accepted.
    pub fn can_reject(&self) -> BookingResult<()> {
        self.guard(&[AssignmentStatus::Offered, AssignmentStatus::Accepted], "reject")
    }

    /// Validates a failure report
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless accepted or started.
    pub fn can_fail(&self) -> BookingResult<()> {
        self.guard(&[AssignmentStatus::Accepted, AssignmentStatus::Started], "fail")
    }

    /// Moves to `status`, stamping the relevant timestamp
    pub fn transition(&mut self, status: AssignmentStatus, now: DateTime<Utc>, reason: Option<String>) {
        self.status = status;
        match status {
            AssignmentStatus::Offered => {},
            AssignmentStatus::Accepted => self.accepted_at = Some(now),
            AssignmentStatus::Started => self.started_at = Some(now),
            AssignmentStatus::Rejected
            | AssignmentStatus::TimedOut
            | AssignmentStatus::Completed
            | AssignmentStatus::Failed
            | AssignmentStatus::Cancelled => self.closed_at = Some(now),
        }
        if reason.is_some() {
            self.reason = reason;
        }
    }
}

/// Candidate ordering policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Best rated first
    #[default]
    HighestRating,
    /// Longest idle first
    LeastRecentlyAssigned,
}

impl SelectionPolicy {
    /// Parses a config value
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rating" | "highest_rating" => Some(Self::HighestRating),
            "least_recent" | "least_recently_assigned" | "lru" => Some(Self::LeastRecentlyAssigned),
            _ => None,
        }
    }

    /// The ranking implementation for this policy
    #[must_use]
    pub fn ranking(self) -> &'static dyn CandidateRanking {
        match self {
            Self::HighestRating => &HighestRating,
            Self::LeastRecentlyAssigned => &LeastRecentlyAssigned,
        }
    }
}

/// Orders eligible workers for sequential offers
pub trait CandidateRanking: Send + Sync {
    /// Compares two candidates; `Less` is offered first
    fn compare(&self, a: &Worker, b: &Worker) -> Ordering;

    /// Sorts candidates in offer order. Ties fall back to the worker ID so
    /// the order is deterministic.
    fn rank(&self, candidates: &mut [Worker]) {
        candidates.sort_by(|a, b| self.compare(a, b).then_with(|| a.id.cmp(&b.id)));
    }
}

/// Highest rating first, then longest idle
#[derive(Clone, Copy, Debug, Default)]
pub struct HighestRating;

impl CandidateRanking for HighestRating {
    fn compare(&self, a: &Worker, b: &Worker) -> Ordering {
        b.rating
            .total_cmp(&a.rating)
            .then_with(|| a.last_assigned_at.cmp(&b.last_assigned_at))
    }
}

/// Longest idle first (never assigned sorts first), then highest rating
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastRecentlyAssigned;

impl CandidateRanking for LeastRecentlyAssigned {
    fn compare(&self, a: &Worker, b: &Worker) -> Ordering {
        a.last_assigned_at
            .cmp(&b.last_assigned_at)
            .then_with(|| b.rating.total_cmp(&a.rating))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()
    }

    fn worker(rating: f64, last: Option<i64>) -> Worker {
        Worker {
            id: WorkerId::new(),
            name: "w".into(),
            services: vec![],
            areas: vec![],
            is_available: true,
            rating,
            last_assigned_at: last.map(|h| now() - Duration::hours(h)),
        }
    }

    fn offered() -> WorkerAssignment {
        WorkerAssignment::offer(
            AssignmentId::new(),
            BookingId::new(),
            WorkerId::new(),
            now(),
            now() + Duration::minutes(15),
        )
    }

    #[test]
    fn start_and_complete_are_idempotent() {
        let mut assignment = offered();
        assert!(assignment.can_accept(now()).unwrap());
        assignment.transition(AssignmentStatus::Accepted, now(), None);
        assert!(!assignment.can_accept(now()).unwrap());

        assert!(assignment.can_complete().is_err());
        assert!(assignment.can_start().unwrap());
        assignment.transition(AssignmentStatus::Started, now(), None);
        assert!(!assignment.can_start().unwrap());

        assert!(assignment.can_complete().unwrap());
        assignment.transition(AssignmentStatus::Completed, now(), None);
        assert!(!assignment.can_complete().unwrap());
        assert!(!assignment.status.is_active());
    }

    #[test]
    fn lapsed_offer_cannot_be_accepted() {
        let assignment = offered();
        assert!(assignment.offer_lapsed(now() + Duration::minutes(15)));
        assert!(assignment.can_accept(now() + Duration::minutes(15)).is_err());
    }

    #[test]
    fn start_requires_acceptance() {
        assert!(offered().can_start().is_err());
    }

    #[test]
    fn highest_rating_orders_by_rating_then_idle_time() {
        let mut candidates = vec![worker(4.0, Some(1)), worker(4.8, Some(1)), worker(4.0, Some(5))];
        let expected = [candidates[1].id, candidates[2].id, candidates[0].id];
        HighestRating.rank(&mut candidates);
        let ids: Vec<_> = candidates.iter().map(|w| w.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn least_recent_puts_never_assigned_first() {
        let mut candidates = vec![worker(5.0, Some(1)), worker(3.0, None), worker(4.0, Some(10))];
        let expected = [candidates[1].id, candidates[2].id, candidates[0].id];
        SelectionPolicy::LeastRecentlyAssigned.ranking().rank(&mut candidates);
        let ids: Vec<_> = candidates.iter().map(|w| w.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn policy_parses_config_values() {
        assert_eq!(SelectionPolicy::parse("rating"), Some(SelectionPolicy::HighestRating));
        assert_eq!(SelectionPolicy::parse("LRU"), Some(SelectionPolicy::LeastRecentlyAssigned));
        assert_eq!(SelectionPolicy::parse("random"), None);
    }
}
