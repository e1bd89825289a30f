//! Data Service Port
//!
//! Defines the interface to the store database that owns tenant credentials,
//! display metadata, and the persisted ONLINE/OFFLINE status.

use crate::domain::value_objects::{PresenceStatus, TenantId};
use async_trait::async_trait;

/// Store database collaborator.
///
/// This is an outbound port. Implementations may hit a real database, so
/// callers must never invoke it while holding registry locks, and slow calls
/// must only stall the connection that issued them.
#[async_trait]
pub trait DataService: Send + Sync {
    /// Check a store's backend credentials.
    ///
    /// `Ok(false)` means the credentials are wrong; `Err` means the
    /// database could not be consulted.
    async fn authenticate_tenant(&self, tenant: &TenantId, auth_code: &str) -> anyhow::Result<bool>;

    /// Human readable store name shown to mobile clients.
    async fn tenant_display_name(&self, tenant: &TenantId) -> anyhow::Result<Option<String>>;

    /// Record a presence transition.
    async fn persist_status(&self, tenant: &TenantId, status: PresenceStatus) -> anyhow::Result<()>;
}
