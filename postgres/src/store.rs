//! `PostgreSQL` booking store.
//!
//! The full [`BookingState`] lives in `bookings.state` as JSONB. Slot claims,
//! assignments and buffer reservations are projected into their own tables
//! so capacity checks, dispatch and the sweep can query them directly.

use crate::{db_error, sql_state};
use async_trait::async_trait;
use booking_core::booking::BookingState;
use booking_core::buffer::BufferRequest;
use booking_core::effect::StorageOp;
use booking_core::error::BookingError;
use booking_core::slot::{SlotAllocator, SlotToken};
use booking_core::types::{AssignmentId, BookingId, SlotKey, TimeWindow, WorkerId};
use booking_runtime::StoreError;
use booking_runtime::store::{BookingStore, UnitOfWork};
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

/// SQLSTATE for an exclusion constraint violation
const EXCLUSION_VIOLATION: &str = "23P01";

/// Default bound on waiting for another transition's row lock
pub const DEFAULT_LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Booking store on `PostgreSQL`
#[derive(Clone)]
pub struct PostgresBookingStore {
    pool: PgPool,
    lock_timeout: std::time::Duration,
}

impl PostgresBookingStore {
    /// Creates a store over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long `begin` waits for a booking that another transition
    /// holds before giving up with [`StoreError::Unavailable`]
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: std::time::Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// The underlying connection pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn window_of((start, end): (DateTime<Utc>, DateTime<Utc>)) -> TimeWindow {
    TimeWindow { start, end }
}

/// Advisory-lock names for a hold on `key`, in a global order.
///
/// A pool hold also locks every pool worker's key because their direct
/// claims and buffer reservations count against the pool.
fn lock_names(key: &SlotKey, pool_workers: &[WorkerId]) -> Vec<String> {
    let mut names = vec![key.to_string()];
    if matches!(key, SlotKey::Pool { .. }) {
        names.extend(
            pool_workers
                .iter()
                .map(|worker_id| SlotKey::Worker { worker_id: *worker_id }.to_string()),
        );
    }
    names.sort_unstable();
    names.dedup();
    names
}

async fn occupied(
    conn: &mut PgConnection,
    key: &SlotKey,
    pool_workers: &[WorkerId],
    window: &TimeWindow,
    now: DateTime<Utc>,
) -> Result<Vec<TimeWindow>, StoreError> {
    let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = match key {
        SlotKey::Pool { .. } => {
            let workers: Vec<Uuid> = pool_workers.iter().map(|w| *w.as_uuid()).collect();
            sqlx::query_as(
                r"
                SELECT starts_at, ends_at
                FROM slot_claims
                WHERE (slot_key = $1 OR worker_id = ANY($2))
                  AND (expires_at IS NULL OR expires_at > $3)
                  AND starts_at < $5 AND ends_at > $4
                UNION ALL
                SELECT busy.starts_at, busy.blocked_until
                FROM (
                    SELECT DISTINCT ON (b.worker_id) b.starts_at, b.blocked_until
                    FROM buffer_reservations b
                    WHERE b.worker_id = ANY($2)
                      AND b.starts_at < $5 AND b.blocked_until > $4
                      AND NOT EXISTS (
                          SELECT 1 FROM slot_claims c
                          WHERE (c.booking_id = b.booking_id OR c.worker_id = b.worker_id)
                            AND (c.slot_key = $1 OR c.worker_id = ANY($2))
                            AND (c.expires_at IS NULL OR c.expires_at > $3)
                            AND c.starts_at < $5 AND c.ends_at > $4
                      )
                    ORDER BY b.worker_id, b.starts_at
                ) busy
                ",
            )
            .bind(key.to_string())
            .bind(workers)
            .bind(now)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(conn)
            .await
        },
        SlotKey::Worker { worker_id } => {
            sqlx::query_as(
                r"
                SELECT starts_at, ends_at
                FROM slot_claims
                WHERE slot_key = $1
                  AND (expires_at IS NULL OR expires_at > $2)
                  AND starts_at < $4 AND ends_at > $3
                UNION ALL
                SELECT b.starts_at, b.blocked_until
                FROM buffer_reservations b
                WHERE b.worker_id = $5
                  AND b.starts_at < $4 AND b.blocked_until > $3
                  AND NOT EXISTS (
                      SELECT 1 FROM slot_claims c
                      WHERE c.booking_id = b.booking_id
                        AND c.slot_key = $1
                        AND (c.expires_at IS NULL OR c.expires_at > $2)
                        AND c.starts_at < $4 AND c.ends_at > $3
                  )
                ",
            )
            .bind(key.to_string())
            .bind(now)
            .bind(window.start)
            .bind(window.end)
            .bind(*worker_id.as_uuid())
            .fetch_all(conn)
            .await
        },
    }
    .map_err(|e| db_error("occupancy query", e))?;

    Ok(rows.into_iter().map(window_of).collect())
}

async fn upsert_assignments(conn: &mut PgConnection, state: &BookingState) -> Result<(), StoreError> {
    for assignment in &state.assignments {
        sqlx::query(
            r"
            INSERT INTO worker_assignments (id, booking_id, worker_id, status, offered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status
            ",
        )
        .bind(*assignment.id.as_uuid())
        .bind(*assignment.booking_id.as_uuid())
        .bind(*assignment.worker_id.as_uuid())
        .bind(assignment.status.as_str())
        .bind(assignment.offered_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("upsert assignment", e))?;
    }
    Ok(())
}

async fn reserve_buffer(conn: &mut PgConnection, request: &BufferRequest) -> Result<(), StoreError> {
    let worker = *request.worker_id.as_uuid();
    let booking = *request.booking_id.as_uuid();
    let blocked = request.window.with_trailing(Duration::minutes(request.buffer_minutes));

    // Pool holds count this worker's buffers; take the same key they lock.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(
            SlotKey::Worker {
                worker_id: request.worker_id,
            }
            .to_string(),
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("worker lock", e))?;

    sqlx::query("DELETE FROM buffer_reservations WHERE worker_id = $1 AND booking_id = $2")
        .bind(worker)
        .bind(booking)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("replace buffer", e))?;

    let existing: Option<(DateTime<Utc>, DateTime<Utc>, i64)> = sqlx::query_as(
        r"
        SELECT starts_at, ends_at, buffer_minutes
        FROM buffer_reservations
        WHERE worker_id = $1 AND booking_id <> $2
          AND starts_at < $4 AND blocked_until > $3
        LIMIT 1
        ",
    )
    .bind(worker)
    .bind(booking)
    .bind(blocked.start)
    .bind(blocked.end)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("buffer check", e))?;

    if let Some((start, end, buffer_minutes)) = existing {
        let window = TimeWindow { start, end }.padded(Duration::minutes(buffer_minutes));
        return Err(StoreError::Conflict(BookingError::BufferConflict {
            worker_id: request.worker_id,
            window,
        }));
    }

    let inserted = sqlx::query(
        r"
        INSERT INTO buffer_reservations (
            worker_id, booking_id, assignment_id, starts_at, ends_at, buffer_minutes, blocked_until
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(worker)
    .bind(booking)
    .bind(*request.assignment_id.as_uuid())
    .bind(request.window.start)
    .bind(request.window.end)
    .bind(request.buffer_minutes)
    .bind(blocked.end)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(()),
        // A concurrent commit won the race after our check.
        Err(e) if sql_state(&e).as_deref() == Some(EXCLUSION_VIOLATION) => {
            metrics::counter!("booking.store.buffer_races").increment(1);
            Err(StoreError::Conflict(BookingError::BufferConflict {
                worker_id: request.worker_id,
                window: request.padded(),
            }))
        },
        Err(e) => Err(db_error("insert buffer", e)),
    }
}

async fn apply_op(conn: &mut PgConnection, booking_id: BookingId, op: &StorageOp) -> Result<(), StoreError> {
    let id = *booking_id.as_uuid();
    let result = match op {
        StorageOp::ReleaseClaim => sqlx::query("DELETE FROM slot_claims WHERE booking_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await,
        StorageOp::PromoteHold => sqlx::query("UPDATE slot_claims SET expires_at = NULL WHERE booking_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await,
        StorageOp::ExtendHold { expires_at } => {
            sqlx::query("UPDATE slot_claims SET expires_at = $2 WHERE booking_id = $1")
                .bind(id)
                .bind(*expires_at)
                .execute(&mut *conn)
                .await
        },
        StorageOp::ReleaseBuffer { worker_id } => {
            sqlx::query("DELETE FROM buffer_reservations WHERE worker_id = $1 AND booking_id = $2")
                .bind(*worker_id.as_uuid())
                .bind(id)
                .execute(&mut *conn)
                .await
        },
        StorageOp::ReserveBuffer(request) => return reserve_buffer(conn, request).await,
    };
    result.map(|_| ()).map_err(|e| db_error("apply storage op", e))
}

#[async_trait]
impl BookingStore for PostgresBookingStore {
    async fn occupancy(
        &self,
        key: &SlotKey,
        pool_workers: &[WorkerId],
        window: &TimeWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeWindow>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(|e| db_error("acquire connection", e))?;
        occupied(&mut conn, key, pool_workers, window, now).await
    }

    #[tracing::instrument(skip_all, fields(slot = %token.key))]
    async fn create_held(
        &self,
        state: &BookingState,
        token: &SlotToken,
        pool_workers: &[WorkerId],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (Some(id), Some(hold)) = (state.id(), state.hold) else {
            return Err(StoreError::Backend("held booking is missing its hold".to_string()));
        };

        let mut tx = self.pool.begin().await.map_err(|e| db_error("begin hold", e))?;

        for name in lock_names(&token.key, pool_workers) {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("slot lock", e))?;
        }

        let taken = occupied(&mut tx, &token.key, pool_workers, &token.claim, now).await?;
        SlotAllocator::ensure_free(&token.claim, token.capacity, &taken).map_err(StoreError::Conflict)?;

        let status = state.status().map_or("held", |s| s.as_str());
        let inserted = sqlx::query(
            r"
            INSERT INTO bookings (id, status, state, hold_expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(*id.as_uuid())
        .bind(status)
        .bind(Json(state))
        .bind(state.hold_deadline())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("insert booking", e))?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("booking {id} already exists")));
        }

        sqlx::query(
            r"
            INSERT INTO slot_claims (booking_id, slot_key, worker_id, starts_at, ends_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(*id.as_uuid())
        .bind(hold.key.to_string())
        .bind(hold.key.worker().map(|w| *w.as_uuid()))
        .bind(hold.claim.start)
        .bind(hold.claim.end)
        .bind(hold.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("insert slot claim", e))?;

        tx.commit().await.map_err(|e| db_error("commit hold", e))?;
        tracing::debug!(booking_id = %id, "hold stored");
        Ok(())
    }

    async fn begin(&self, id: BookingId) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("begin transition", e))?;
        let set_timeout = format!("SET LOCAL lock_timeout = {}", self.lock_timeout.as_millis().max(1));
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("set lock timeout", e))?;
        let row: Option<(Json<BookingState>,)> = sqlx::query_as("SELECT state FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(*id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("lock booking", e))?;

        let Some((Json(draft),)) = row else {
            return Err(StoreError::NotFound(id));
        };
        Ok(Box::new(PgUnitOfWork { tx, draft }))
    }

    async fn load(&self, id: BookingId) -> Result<Option<BookingState>, StoreError> {
        let row: Option<(Json<BookingState>,)> = sqlx::query_as("SELECT state FROM bookings WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("load booking", e))?;
        Ok(row.map(|(Json(state),)| state))
    }

    async fn find_by_assignment(&self, id: AssignmentId) -> Result<Option<BookingId>, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT booking_id FROM worker_assignments WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("find assignment", e))?;
        Ok(row.map(|(booking,)| BookingId::from_uuid(booking)))
    }

    async fn due_holds(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BookingId>, StoreError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r"
            SELECT id FROM bookings
            WHERE hold_expires_at <= $1
            ORDER BY hold_expires_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("scan lapsed holds", e))?;
        Ok(rows.into_iter().map(|(id,)| BookingId::from_uuid(id)).collect())
    }

    async fn due_offers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(BookingId, AssignmentId)>, StoreError> {
        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r"
            SELECT id, offer_assignment_id FROM bookings
            WHERE offer_expires_at <= $1 AND offer_assignment_id IS NOT NULL
            ORDER BY offer_expires_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("scan lapsed offers", e))?;
        Ok(rows
            .into_iter()
            .map(|(booking, assignment)| (BookingId::from_uuid(booking), AssignmentId::from_uuid(assignment)))
            .collect())
    }

    async fn worker_busy(&self, candidate: &BufferRequest, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let blocked = candidate.window.with_trailing(Duration::minutes(candidate.buffer_minutes));
        let (busy,): (bool,) = sqlx::query_as(
            r"
            SELECT EXISTS (
                SELECT 1 FROM buffer_reservations
                WHERE worker_id = $1 AND booking_id <> $2
                  AND starts_at < $4 AND blocked_until > $3
            ) OR EXISTS (
                SELECT 1 FROM slot_claims
                WHERE slot_key = $5 AND booking_id <> $2
                  AND (expires_at IS NULL OR expires_at > $6)
                  AND starts_at < $4 AND ends_at > $3
            )
            ",
        )
        .bind(*candidate.worker_id.as_uuid())
        .bind(*candidate.booking_id.as_uuid())
        .bind(blocked.start)
        .bind(blocked.end)
        .bind(
            SlotKey::Worker {
                worker_id: candidate.worker_id,
            }
            .to_string(),
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("worker busy check", e))?;
        Ok(busy)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| db_error("ping", e))
    }
}

/// Row-locked transition; rolls back when dropped
struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    draft: BookingState,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn state(&self) -> &BookingState {
        &self.draft
    }

    fn state_mut(&mut self) -> &mut BookingState {
        &mut self.draft
    }

    async fn commit(self: Box<Self>, ops: Vec<StorageOp>) -> Result<(), StoreError> {
        let Self { mut tx, draft } = *self;
        let Some(booking_id) = draft.id() else {
            return Err(StoreError::Backend("cannot commit an empty booking".to_string()));
        };

        for op in &ops {
            apply_op(&mut tx, booking_id, op).await?;
        }

        let offer = draft.offer_deadline();
        sqlx::query(
            r"
            UPDATE bookings
            SET status = $2,
                state = $3,
                hold_expires_at = $4,
                offer_assignment_id = $5,
                offer_expires_at = $6,
                updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(*booking_id.as_uuid())
        .bind(draft.status().map_or("held", |s| s.as_str()))
        .bind(Json(&draft))
        .bind(draft.hold_deadline())
        .bind(offer.map(|(assignment_id, _)| *assignment_id.as_uuid()))
        .bind(offer.map(|(_, deadline)| deadline))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("update booking", e))?;

        upsert_assignments(&mut tx, &draft).await?;
        tx.commit().await.map_err(|e| db_error("commit transition", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use booking_core::types::{AreaId, ServiceId};

    #[test]
    fn pool_holds_lock_their_workers_in_order() {
        let pool = SlotKey::Pool {
            service_id: ServiceId::new(),
            area_id: AreaId::new(),
        };
        let (a, b) = (WorkerId::new(), WorkerId::new());
        let names = lock_names(&pool, &[b, a, b]);
        assert_eq!(names.len(), 3);
        assert!(names[0].starts_with("pool:"));
        assert!(names.windows(2).all(|pair| pair[0] < pair[1]));

        let worker = SlotKey::Worker { worker_id: a };
        assert_eq!(lock_names(&worker, &[b]), vec![worker.to_string()]);
    }
}
