//! `PostgreSQL` backend for the booking engine.
//!
//! Implements the runtime's persistence seams on top of sqlx:
//!
//! - [`PostgresBookingStore`]: bookings, slot claims, assignments and buffer
//!   reservations. Hold placement serializes on transaction-scoped advisory
//!   locks; transitions lock the booking row with `SELECT ... FOR UPDATE`.
//! - [`PostgresConfigProvider`]: the `admin_configurations` table.
//! - [`PostgresDirectory`]: services and workers.
//!
//! Queries are checked at runtime, so no `DATABASE_URL` is needed to build.
//!
//! # Example
//!
//! ```ignore
//! use booking_postgres::{PostgresBookingStore, connect};
//!
//! let pool = connect("postgres://localhost/bookings", 10).await?;
//! booking_postgres::migrate(&pool).await?;
//! let store = PostgresBookingStore::new(pool);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod directory;
mod store;

pub use config::PostgresConfigProvider;
pub use directory::PostgresDirectory;
pub use store::PostgresBookingStore;

use booking_runtime::StoreError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Opens a connection pool
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(format!("failed to connect: {e}")))
}

/// Runs the bundled migrations
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))
}

/// SQLSTATE raised when `lock_timeout` expires
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Classifies a sqlx failure
pub(crate) fn db_error(context: &str, error: sqlx::Error) -> StoreError {
    if sql_state(&error).as_deref() == Some(LOCK_NOT_AVAILABLE) {
        return StoreError::Unavailable(format!("{context}: {error}"));
    }
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{context}: {error}"))
        },
        other => StoreError::Backend(format!("{context}: {other}")),
    }
}

/// Postgres SQLSTATE of a failed query, if any
pub(crate) fn sql_state(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}
