//! Services and workers on `PostgreSQL`.

use crate::db_error;
use async_trait::async_trait;
use booking_core::types::{AreaId, Money, Service, ServiceId, Worker, WorkerId};
use booking_runtime::StoreError;
use booking_runtime::directory::Directory;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

type ServiceRow = (Uuid, String, i64, i64, bool);
type WorkerRow = (Uuid, String, Vec<Uuid>, Vec<Uuid>, bool, f64, Option<DateTime<Utc>>);

const WORKER_COLUMNS: &str = "id, name, services, areas, is_available, rating, last_assigned_at";

fn service_from((id, name, duration_minutes, price_cents, active): ServiceRow) -> Service {
    Service {
        id: ServiceId::from_uuid(id),
        name,
        duration_minutes,
        price: Money::from_cents(u64::try_from(price_cents).unwrap_or(0)),
        active,
    }
}

fn worker_from((id, name, services, areas, is_available, rating, last_assigned_at): WorkerRow) -> Worker {
    Worker {
        id: WorkerId::from_uuid(id),
        name,
        services: services.into_iter().map(ServiceId::from_uuid).collect(),
        areas: areas.into_iter().map(AreaId::from_uuid).collect(),
        is_available,
        rating,
        last_assigned_at,
    }
}

/// [`Directory`] over the `services` and `workers` tables
#[derive(Clone)]
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    /// Creates a directory over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a service
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails or the price does not fit.
    pub async fn upsert_service(&self, service: &Service) -> Result<(), StoreError> {
        let price = i64::try_from(service.price.cents())
            .map_err(|_| StoreError::Backend(format!("price of service {} overflows", service.id)))?;
        sqlx::query(
            r"
            INSERT INTO services (id, name, duration_minutes, price_cents, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                duration_minutes = EXCLUDED.duration_minutes,
                price_cents = EXCLUDED.price_cents,
                active = EXCLUDED.active
            ",
        )
        .bind(*service.id.as_uuid())
        .bind(&service.name)
        .bind(service.duration_minutes)
        .bind(price)
        .bind(service.active)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert service", e))?;
        Ok(())
    }

    /// Inserts or replaces a worker
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn upsert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        let services: Vec<Uuid> = worker.services.iter().map(|s| *s.as_uuid()).collect();
        let areas: Vec<Uuid> = worker.areas.iter().map(|a| *a.as_uuid()).collect();
        sqlx::query(
            r"
            INSERT INTO workers (id, name, services, areas, is_available, rating, last_assigned_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                services = EXCLUDED.services,
                areas = EXCLUDED.areas,
                is_available = EXCLUDED.is_available,
                rating = EXCLUDED.rating,
                last_assigned_at = EXCLUDED.last_assigned_at
            ",
        )
        .bind(*worker.id.as_uuid())
        .bind(&worker.name)
        .bind(services)
        .bind(areas)
        .bind(worker.is_available)
        .bind(worker.rating)
        .bind(worker.last_assigned_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert worker", e))?;
        Ok(())
    }
}

#[async_trait]
impl Directory for PostgresDirectory {
    async fn service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        let row: Option<ServiceRow> =
            sqlx::query_as("SELECT id, name, duration_minutes, price_cents, active FROM services WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("load service", e))?;
        Ok(row.map(service_from))
    }

    async fn worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        let row: Option<WorkerRow> = sqlx::query_as(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("load worker", e))?;
        Ok(row.map(worker_from))
    }

    async fn eligible_workers(&self, service_id: ServiceId, area_id: AreaId) -> Result<Vec<Worker>, StoreError> {
        let rows: Vec<WorkerRow> = sqlx::query_as(&format!(
            r"
            SELECT {WORKER_COLUMNS} FROM workers
            WHERE is_available AND $1 = ANY(services) AND $2 = ANY(areas)
            ORDER BY id
            "
        ))
        .bind(*service_id.as_uuid())
        .bind(*area_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("eligible workers", e))?;
        Ok(rows.into_iter().map(worker_from).collect())
    }

    async fn set_availability(&self, id: WorkerId, available: bool) -> Result<Option<Worker>, StoreError> {
        let row: Option<WorkerRow> = sqlx::query_as(&format!(
            "UPDATE workers SET is_available = $2 WHERE id = $1 RETURNING {WORKER_COLUMNS}"
        ))
        .bind(*id.as_uuid())
        .bind(available)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("set availability", e))?;
        Ok(row.map(worker_from))
    }

    async fn record_assignment(&self, id: WorkerId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE workers SET last_assigned_at = $2 WHERE id = $1")
            .bind(*id.as_uuid())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("record assignment", e))?;
        Ok(())
    }
}
