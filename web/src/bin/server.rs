//! Booking engine HTTP server.
//!
//! With `DATABASE_URL` set the engine runs on `PostgreSQL`, reading services,
//! workers and admin configuration from the database. Without it an
//! in-memory backend is used, seeded with a demo catalog for local testing.

use anyhow::Context;
use booking_core::config::BookingConfig;
use booking_core::environment::SystemClock;
use booking_core::types::{AreaId, Money, Service, ServiceId, Worker, WorkerId};
use booking_postgres::{PostgresBookingStore, PostgresConfigProvider, PostgresDirectory};
use booking_runtime::BookingService;
use booking_runtime::config::ConfigCache;
use booking_runtime::directory::{Directory, InMemoryDirectory};
use booking_runtime::events::BroadcastPublisher;
use booking_runtime::gateway::MockPaymentGateway;
use booking_runtime::memory::InMemoryBookingStore;
use booking_runtime::metrics::MetricsServer;
use booking_runtime::store::BookingStore;
use booking_runtime::sweeper::Sweeper;
use booking_web::{AppConfig, AppState, build_router};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Backend {
    store: Arc<dyn BookingStore>,
    directory: Arc<dyn Directory>,
    config: Arc<ConfigCache>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,booking_runtime=debug,booking_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking server");

    let config = AppConfig::from_env();
    info!(
        bind_addr = %config.bind_addr,
        metrics_addr = %config.metrics_addr,
        postgres = config.database_url.is_some(),
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    if let Err(e) = metrics.start() {
        warn!(error = %e, "metrics exporter disabled");
    }

    let backend = match &config.database_url {
        Some(url) => postgres_backend(url, &config).await?,
        None => memory_backend().await,
    };

    let bus = BroadcastPublisher::default();
    spawn_event_log(bus.subscribe());

    let service = BookingService::new(
        backend.store,
        backend.directory,
        MockPaymentGateway::shared(),
        Arc::new(bus),
        backend.config,
        Arc::new(SystemClock),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(service.clone())
        .with_interval(config.sweep_interval)
        .with_batch_size(config.sweep_batch_size);
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    let state = AppState::new(service).with_metrics(metrics.handle());
    let app = build_router(state, config.request_timeout);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(address = %config.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    shutdown_tx.send(true).ok();
    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "sweeper task panicked");
    }

    info!("Server shut down");
    Ok(())
}

async fn postgres_backend(url: &str, config: &AppConfig) -> anyhow::Result<Backend> {
    info!("Connecting to PostgreSQL...");
    let pool = booking_postgres::connect(url, config.database_max_connections).await?;
    booking_postgres::migrate(&pool).await?;
    info!("Migrations applied");

    let provider = Arc::new(PostgresConfigProvider::new(pool.clone()));
    Ok(Backend {
        store: Arc::new(PostgresBookingStore::new(pool.clone())),
        directory: Arc::new(PostgresDirectory::new(pool)),
        config: Arc::new(ConfigCache::new(provider, config.config_ttl)),
    })
}

async fn memory_backend() -> Backend {
    warn!("DATABASE_URL not set; bookings are kept in memory and lost on restart");
    let directory = InMemoryDirectory::new();

    let service = Service {
        id: ServiceId::new(),
        name: "Home cleaning".to_string(),
        duration_minutes: 120,
        price: Money::from_cents(8_000),
        active: true,
    };
    let area_id = AreaId::new();
    directory.add_service(service.clone()).await;

    for (name, rating) in [("Ana", 4.9), ("Ben", 4.6), ("Chloe", 4.2)] {
        let worker = Worker {
            id: WorkerId::new(),
            name: name.to_string(),
            services: vec![service.id],
            areas: vec![area_id],
            is_available: true,
            rating,
            last_assigned_at: None,
        };
        info!(worker_id = %worker.id, name, "demo worker");
        directory.add_worker(worker).await;
    }
    info!(service_id = %service.id, %area_id, "demo catalog seeded");

    Backend {
        store: Arc::new(InMemoryBookingStore::new()),
        directory: Arc::new(directory),
        config: Arc::new(ConfigCache::fixed(BookingConfig::default())),
    }
}

/// Logs every published event; stands in for the notification service
fn spawn_event_log(mut events: broadcast::Receiver<booking_core::events::BookingEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(booking_id = %event.booking_id(), event = event.name(), "booking event"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event log fell behind");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Graceful shutdown signal handler.
///
/// Waits for:
/// - Ctrl+C (SIGINT)
/// - SIGTERM (in production environments)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
