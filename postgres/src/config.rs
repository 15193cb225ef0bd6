//! Admin configuration rows from `admin_configurations`.

use crate::db_error;
use async_trait::async_trait;
use booking_core::config::{ConfigEntry, ConfigValueType};
use booking_runtime::StoreError;
use booking_runtime::config::ConfigProvider;
use sqlx::PgPool;

const fn type_name(value_type: ConfigValueType) -> &'static str {
    match value_type {
        ConfigValueType::Bool => "bool",
        ConfigValueType::Int => "int",
        ConfigValueType::String => "string",
    }
}

/// [`ConfigProvider`] reading the `admin_configurations` table
#[derive(Clone)]
pub struct PostgresConfigProvider {
    pool: PgPool,
}

impl PostgresConfigProvider {
    /// Creates a provider over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces one entry.
    ///
    /// Running caches pick the change up on their next refresh.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn set(&self, entry: &ConfigEntry) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO admin_configurations (key, value, value_type, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, value_type = EXCLUDED.value_type, updated_at = now()
            ",
        )
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(type_name(entry.value_type))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("write configuration", e))?;

        tracing::info!(key = %entry.key, value = %entry.value, "configuration updated");
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for PostgresConfigProvider {
    async fn entries(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT key, value, value_type FROM admin_configurations ORDER BY key")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("read configuration", e))?;

        Ok(rows
            .into_iter()
            .map(|(key, value, value_type)| ConfigEntry::new(key, value, ConfigValueType::parse(&value_type)))
            .collect())
    }
}
