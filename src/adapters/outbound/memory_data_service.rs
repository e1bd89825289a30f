//! In-Memory Data Service
//!
//! Implements DataService on a DashMap. Used for local development and tests;
//! an outage can be simulated with `set_available(false)`.

use crate::domain::ports::DataService;
use crate::domain::value_objects::{PresenceStatus, TenantId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
struct StoreRecord {
    auth_code: String,
    name: String,
    status: Option<PresenceStatus>,
}

/// DashMap-backed store directory.
pub struct MemoryDataService {
    stores: DashMap<TenantId, StoreRecord>,
    available: AtomicBool,
    /// Every persisted transition, in order
    status_log: Mutex<Vec<(TenantId, PresenceStatus)>>,
}

impl MemoryDataService {
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
            available: AtomicBool::new(true),
            status_log: Mutex::new(Vec::new()),
        }
    }

    /// Builder-style variant of [`add_store`](Self::add_store).
    pub fn with_store(self, code: &str, auth_code: &str, name: &str) -> Self {
        self.add_store(code, auth_code, name);
        self
    }

    pub fn add_store(&self, code: &str, auth_code: &str, name: &str) {
        self.stores.insert(
            TenantId::new(code),
            StoreRecord {
                auth_code: auth_code.to_string(),
                name: name.to_string(),
                status: None,
            },
        );
    }

    /// Simulate the database becoming unreachable (or recovering).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn status_of(&self, tenant: &TenantId) -> Option<PresenceStatus> {
        self.stores.get(tenant).and_then(|r| r.status)
    }

    /// Persisted transitions for one store, oldest first.
    pub fn status_history(&self, tenant: &TenantId) -> Vec<PresenceStatus> {
        self.status_log
            .lock()
            .iter()
            .filter(|(t, _)| t == tenant)
            .map(|(_, s)| *s)
            .collect()
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("store database unreachable")
        }
    }
}

impl Default for MemoryDataService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn authenticate_tenant(&self, tenant: &TenantId, auth_code: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        Ok(self
            .stores
            .get(tenant)
            .map(|r| r.auth_code == auth_code)
            .unwrap_or(false))
    }

    async fn tenant_display_name(&self, tenant: &TenantId) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        Ok(self.stores.get(tenant).map(|r| r.name.clone()))
    }

    async fn persist_status(&self, tenant: &TenantId, status: PresenceStatus) -> anyhow::Result<()> {
        self.check_available()?;
        if let Some(mut record) = self.stores.get_mut(tenant) {
            record.status = Some(status);
        }
        self.status_log.lock().push((tenant.clone(), status));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authenticate() {
        let data = MemoryDataService::new().with_store("S1", "secret", "Store One");

        assert!(data.authenticate_tenant(&"S1".into(), "secret").await.unwrap());
        assert!(!data.authenticate_tenant(&"S1".into(), "nope").await.unwrap());
        assert!(!data.authenticate_tenant(&"S9".into(), "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let data = MemoryDataService::new().with_store("S1", "secret", "Store One");
        data.set_available(false);

        assert!(data.authenticate_tenant(&"S1".into(), "secret").await.is_err());
        assert!(data.tenant_display_name(&"S1".into()).await.is_err());
        assert!(data
            .persist_status(&"S1".into(), PresenceStatus::Online)
            .await
            .is_err());

        data.set_available(true);
        assert!(data.authenticate_tenant(&"S1".into(), "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_display_name() {
        let data = MemoryDataService::new().with_store("S1", "secret", "Store One");
        assert_eq!(
            data.tenant_display_name(&"S1".into()).await.unwrap().as_deref(),
            Some("Store One")
        );
        assert_eq!(data.tenant_display_name(&"S2".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_history() {
        let data = MemoryDataService::new().with_store("S1", "secret", "Store One");
        data.persist_status(&"S1".into(), PresenceStatus::Online).await.unwrap();
        data.persist_status(&"S1".into(), PresenceStatus::Offline).await.unwrap();

        assert_eq!(data.status_of(&"S1".into()), Some(PresenceStatus::Offline));
        assert_eq!(
            data.status_history(&"S1".into()),
            vec![PresenceStatus::Online, PresenceStatus::Offline]
        );
    }
}
