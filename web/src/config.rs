//! Process configuration loaded from environment variables.
//!
//! Domain parameters (working hours, hold time, buffers) are not read here;
//! they come from the admin configuration table through the runtime's
//! config cache.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// HTTP listen address (`BIND_ADDR`)
    pub bind_addr: SocketAddr,
    /// Prometheus scrape address (`METRICS_ADDR`)
    pub metrics_addr: SocketAddr,
    /// `PostgreSQL` URL; the in-memory backend is used when unset
    pub database_url: Option<String>,
    /// Pool size (`DATABASE_MAX_CONNECTIONS`)
    pub database_max_connections: u32,
    /// Pause between sweep passes (`SWEEP_INTERVAL_SECS`)
    pub sweep_interval: Duration,
    /// Due items handled per sweep pass (`SWEEP_BATCH_SIZE`)
    pub sweep_batch_size: usize,
    /// Admin configuration cache TTL (`CONFIG_TTL_SECS`)
    pub config_ttl: Duration,
    /// Per-request deadline (`REQUEST_TIMEOUT_SECS`)
    pub request_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    /// Loads configuration from the process environment.
    ///
    /// Missing or unparsable values fall back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            bind_addr: lookup("BIND_ADDR")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            metrics_addr: lookup("METRICS_ADDR")
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 9090))),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(10),
            sweep_interval: Duration::from_secs(parsed("SWEEP_INTERVAL_SECS").unwrap_or(15).max(1)),
            sweep_batch_size: lookup("SWEEP_BATCH_SIZE")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(100),
            config_ttl: Duration::from_secs(parsed("CONFIG_TTL_SECS").unwrap_or(30)),
            request_timeout: Duration::from_secs(parsed("REQUEST_TIMEOUT_SECS").unwrap_or(30)),
        }
    }
}
