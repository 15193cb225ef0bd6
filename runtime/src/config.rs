//! Admin configuration sources and snapshot caching.
//!
//! Every operation reads one immutable [`BookingConfig`] snapshot and hands
//! it to the reducer through its environment, so an admin edit never lands
//! halfway through a transition. [`ConfigCache`] refreshes the snapshot from
//! a [`ConfigProvider`] at most once per TTL.

use crate::error::StoreError;
use async_trait::async_trait;
use booking_core::config::{BookingConfig, ConfigEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Source of raw admin configuration rows
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Loads every configuration entry
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing store cannot be read.
    async fn entries(&self) -> Result<Vec<ConfigEntry>, StoreError>;
}

/// In-memory provider; entries can be changed at runtime
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    entries: RwLock<Vec<ConfigEntry>>,
}

impl StaticConfigProvider {
    /// Creates a provider serving `entries`
    #[must_use]
    pub fn new(entries: Vec<ConfigEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Inserts or replaces an entry by key
    pub async fn set(&self, entry: ConfigEntry) {
        let mut entries = self.entries.write().await;
        entries.retain(|e| e.key != entry.key);
        entries.push(entry);
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn entries(&self) -> Result<Vec<ConfigEntry>, StoreError> {
        Ok(self.entries.read().await.clone())
    }
}

struct Cached {
    loaded_at: Instant,
    config: Arc<BookingConfig>,
}

/// TTL cache producing immutable configuration snapshots
pub struct ConfigCache {
    provider: Arc<dyn ConfigProvider>,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
}

impl ConfigCache {
    /// Creates a cache over `provider`
    #[must_use]
    pub fn new(provider: Arc<dyn ConfigProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Cache serving fixed defaults, for tests and tooling
    #[must_use]
    pub fn fixed(config: BookingConfig) -> Self {
        Self {
            provider: Arc::new(StaticConfigProvider::default()),
            ttl: Duration::MAX,
            cached: RwLock::new(Some(Cached {
                loaded_at: Instant::now(),
                config: Arc::new(config),
            })),
        }
    }

    /// Current snapshot, refreshed when older than the TTL.
    ///
    /// A failed refresh keeps serving the previous snapshot (or defaults if
    /// nothing was ever loaded) and retries on the next call.
    pub async fn snapshot(&self) -> Arc<BookingConfig> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Arc::clone(&cached.config);
            }
        }

        let mut cached = self.cached.write().await;
        // Another caller may have refreshed while we waited.
        if let Some(current) = cached.as_ref() {
            if current.loaded_at.elapsed() < self.ttl {
                return Arc::clone(&current.config);
            }
        }

        match self.provider.entries().await {
            Ok(entries) => {
                let config = Arc::new(BookingConfig::from_entries(&entries));
                tracing::debug!(entries = entries.len(), "booking configuration refreshed");
                *cached = Some(Cached {
                    loaded_at: Instant::now(),
                    config: Arc::clone(&config),
                });
                config
            },
            Err(error) => {
                tracing::warn!(%error, "configuration refresh failed, serving previous snapshot");
                cached
                    .as_ref()
                    .map_or_else(|| Arc::new(BookingConfig::default()), |c| Arc::clone(&c.config))
            },
        }
    }

    /// Forces the next snapshot to reload
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
