//! Catalog of services and workers read by slot checks and dispatch.

use crate::error::StoreError;
use async_trait::async_trait;
use booking_core::types::{AreaId, Service, ServiceId, Worker, WorkerId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read access to services and workers, plus the two worker fields the
/// engine writes
#[async_trait]
pub trait Directory: Send + Sync {
    /// Looks up a service
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn service(&self, id: ServiceId) -> Result<Option<Service>, StoreError>;

    /// Looks up a worker
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError>;

    /// Available workers who perform `service_id` in `area_id`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn eligible_workers(&self, service_id: ServiceId, area_id: AreaId) -> Result<Vec<Worker>, StoreError>;

    /// Toggles a worker's availability, returning the updated worker
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn set_availability(&self, id: WorkerId, available: bool) -> Result<Option<Worker>, StoreError>;

    /// Stamps the worker's last assignment time, used by the least-recent policy
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    async fn record_assignment(&self, id: WorkerId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// In-memory [`Directory`]
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    services: RwLock<HashMap<ServiceId, Service>>,
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl InMemoryDirectory {
    /// Creates an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a service
    pub async fn add_service(&self, service: Service) {
        self.services.write().await.insert(service.id, service);
    }

    /// Adds or replaces a worker
    pub async fn add_worker(&self, worker: Worker) {
        self.workers.write().await.insert(worker.id, worker);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        Ok(self.services.read().await.get(&id).cloned())
    }

    async fn worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        Ok(self.workers.read().await.get(&id).cloned())
    }

    async fn eligible_workers(&self, service_id: ServiceId, area_id: AreaId) -> Result<Vec<Worker>, StoreError> {
        let mut eligible: Vec<Worker> = self
            .workers
            .read()
            .await
            .values()
            .filter(|w| w.can_serve(service_id, area_id))
            .cloned()
            .collect();
        eligible.sort_by_key(|w| w.id);
        Ok(eligible)
    }

    async fn set_availability(&self, id: WorkerId, available: bool) -> Result<Option<Worker>, StoreError> {
        let mut workers = self.workers.write().await;
        Ok(workers.get_mut(&id).map(|worker| {
            worker.is_available = available;
            worker.clone()
        }))
    }

    async fn record_assignment(&self, id: WorkerId, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(worker) = self.workers.write().await.get_mut(&id) {
            worker.last_assigned_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use booking_testing::fixtures::{service, worker};

    #[tokio::test]
    async fn unavailable_workers_are_not_eligible() {
        let directory = InMemoryDirectory::new();
        let service = service();
        let area_id = AreaId::new();
        let ana = worker("Ana", service.id, area_id, 4.8);
        let ben = worker("Ben", service.id, area_id, 4.1);
        directory.add_worker(ana.clone()).await;
        directory.add_worker(ben.clone()).await;
        directory.add_worker(worker("Cho", service.id, AreaId::new(), 5.0)).await;

        assert_eq!(directory.eligible_workers(service.id, area_id).await.unwrap().len(), 2);

        let updated = directory.set_availability(ben.id, false).await.unwrap().unwrap();
        assert!(!updated.is_available);
        let eligible = directory.eligible_workers(service.id, area_id).await.unwrap();
        assert_eq!(eligible.iter().map(|w| w.id).collect::<Vec<_>>(), vec![ana.id]);
    }

    #[tokio::test]
    async fn unknown_worker_availability_is_none() {
        let directory = InMemoryDirectory::new();
        assert!(directory.set_availability(WorkerId::new(), true).await.unwrap().is_none());
    }
}
