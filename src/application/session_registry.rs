//! Session Registry
//!
//! Owns the tenant (store backend) and client binding tables. Every mutation of
//! those tables goes through this type.
//!
//! Tables are DashMaps, so locking is sharded per key. No method holds a guard
//! on one map while touching another, and no guard is held across an await.
//!
//! Presence transitions are persisted by a single background task fed through
//! a channel, so the data service sees them in the order they happened.

use crate::application::connection::ConnectionHandle;
use crate::domain::entities::{ClientBinding, TenantBinding};
use crate::domain::errors::AuthError;
use crate::domain::ports::DataService;
use crate::domain::value_objects::{ConnectionId, PresenceStatus, TenantId};
use crate::protocol::{self, Envelope};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

type StatusUpdate = (TenantId, PresenceStatus);

/// Result of a successful store backend registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantAck {
    pub tenant_id: TenantId,
    /// Whether an earlier binding for the same store was replaced
    pub replaced: bool,
}

/// Result of a client registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAck {
    pub tenant_id: TenantId,
    pub backend_online: bool,
}

pub struct SessionRegistry {
    data_service: Arc<dyn DataService>,
    /// Every live socket, backend or client
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    /// At most one ONLINE binding per store
    tenants: DashMap<TenantId, TenantBinding>,
    /// Reverse index: backend connection -> store it serves
    backends: DashMap<ConnectionId, TenantId>,
    clients: DashMap<ConnectionId, ClientBinding>,
    /// Broadcast groups: clients bound to each store
    groups: DashMap<TenantId, HashSet<ConnectionId>>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    /// Held until the persister task is started on first use
    status_rx: Mutex<Option<mpsc::UnboundedReceiver<StatusUpdate>>>,
}

impl SessionRegistry {
    pub fn new(data_service: Arc<dyn DataService>) -> Self {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            data_service,
            connections: DashMap::new(),
            tenants: DashMap::new(),
            backends: DashMap::new(),
            clients: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    pub fn data_service(&self) -> &Arc<dyn DataService> {
        &self.data_service
    }

    /// Make a freshly accepted socket addressable.
    pub fn attach(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.id().clone(), handle);
    }

    /// Forget a socket's outbound handle. Bindings are removed separately.
    pub fn detach(&self, conn: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(conn).map(|(_, h)| h)
    }

    pub fn connection(&self, conn: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(conn).map(|h| h.value().clone())
    }

    /// Authenticate a store backend and make it the store's single binding.
    ///
    /// A second registration for the same store silently replaces the first,
    /// which is what a reconnecting backend does.
    pub async fn register_tenant(
        &self,
        tenant: TenantId,
        auth_code: &str,
        conn: &ConnectionId,
    ) -> Result<TenantAck, AuthError> {
        if tenant.as_str().is_empty() || auth_code.is_empty() {
            return Err(AuthError::MissingFields);
        }

        match self.data_service.authenticate_tenant(&tenant, auth_code).await {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::InvalidCredentials),
            Err(e) => {
                tracing::error!("store auth lookup failed for {}: {:?}", tenant, e);
                return Err(AuthError::Unavailable(e.to_string()));
            }
        }

        let previous = self
            .tenants
            .insert(tenant.clone(), TenantBinding::new(tenant.clone(), conn.clone()));

        if let Some(prev) = &previous {
            if prev.connection_id != *conn {
                self.backends
                    .remove_if(&prev.connection_id, |_, t| *t == tenant);
                tracing::info!(
                    "store {} re-registered, replacing connection {}",
                    tenant,
                    prev.connection_id
                );
            }
        }

        // The same socket switching stores leaves its old store behind.
        if let Some(old_tenant) = self.backends.insert(conn.clone(), tenant.clone()) {
            if old_tenant != tenant
                && self
                    .tenants
                    .remove_if(&old_tenant, |_, b| b.connection_id == *conn)
                    .is_some()
            {
                self.go_offline(&old_tenant);
            }
        }

        self.broadcast(&tenant, protocol::presence_event(&tenant, PresenceStatus::Online));
        self.queue_status(tenant.clone(), PresenceStatus::Online);

        tracing::info!("store registered: {}, conn: {}", tenant, conn);
        Ok(TenantAck {
            tenant_id: tenant,
            replaced: previous.is_some(),
        })
    }

    /// Bind a client to a store. Always succeeds, even if the store is offline.
    pub fn register_client(&self, tenant: TenantId, conn: &ConnectionId) -> ClientAck {
        let binding = ClientBinding::new(conn.clone(), tenant.clone());
        if let Some(prev) = self.clients.insert(conn.clone(), binding) {
            if prev.tenant_id != tenant {
                self.leave_group(&prev.tenant_id, conn);
            }
        }
        self.groups
            .entry(tenant.clone())
            .or_default()
            .insert(conn.clone());

        let backend_online = self.tenants.contains_key(&tenant);
        if !backend_online {
            if let Some(handle) = self.connection(conn) {
                handle.send(protocol::presence_event(&tenant, PresenceStatus::Offline));
            }
        }

        tracing::info!("client registered for store: {}, conn: {}", tenant, conn);
        ClientAck {
            tenant_id: tenant,
            backend_online,
        }
    }

    /// Outbound handle of a store's ONLINE backend.
    pub fn resolve_backend(&self, tenant: &TenantId) -> Option<Arc<ConnectionHandle>> {
        let conn = self.tenants.get(tenant).map(|b| b.connection_id.clone())?;
        self.connection(&conn)
    }

    /// Store a client is bound to.
    pub fn resolve_tenant(&self, conn: &ConnectionId) -> Option<TenantId> {
        self.clients.get(conn).map(|b| b.tenant_id.clone())
    }

    /// Store a backend connection currently serves.
    pub fn backend_tenant(&self, conn: &ConnectionId) -> Option<TenantId> {
        self.backends.get(conn).map(|t| t.value().clone())
    }

    pub fn tenant_binding(&self, tenant: &TenantId) -> Option<TenantBinding> {
        self.tenants.get(tenant).map(|b| b.value().clone())
    }

    pub fn tenant_status(&self, tenant: &TenantId) -> PresenceStatus {
        if self.tenants.contains_key(tenant) {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    /// Record activity from a backend connection.
    ///
    /// Returns the store it serves, or None if the connection is not (or no
    /// longer) a registered backend.
    pub fn touch_backend(&self, conn: &ConnectionId) -> Option<TenantId> {
        let tenant = self.backend_tenant(conn)?;
        let mut binding = self.tenants.get_mut(&tenant)?;
        if binding.connection_id != *conn {
            return None;
        }
        binding.touch();
        drop(binding);
        Some(tenant)
    }

    /// Drop a store's binding (explicit removal). Idempotent.
    pub fn remove_tenant(&self, tenant: &TenantId) -> Option<TenantBinding> {
        let (_, mut binding) = self.tenants.remove(tenant)?;
        self.backends
            .remove_if(&binding.connection_id, |_, t| t == tenant);
        binding.status = PresenceStatus::Offline;
        self.go_offline(tenant);
        tracing::info!("store disconnected: {}", tenant);
        Some(binding)
    }

    /// Drop whatever store a closing backend connection was serving.
    ///
    /// A connection that was already replaced by a newer registration
    /// leaves the newer binding untouched.
    pub fn remove_backend_connection(&self, conn: &ConnectionId) -> Option<TenantId> {
        let (_, tenant) = self.backends.remove(conn)?;
        self.tenants
            .remove_if(&tenant, |_, b| b.connection_id == *conn)?;
        self.go_offline(&tenant);
        tracing::info!("store disconnected: {}, conn: {}", tenant, conn);
        Some(tenant)
    }

    /// Remove every binding silent for longer than `timeout` at `now`.
    ///
    /// Staleness is re-checked under the shard lock, so a heartbeat landing
    /// between the scan and the removal keeps the store online.
    pub fn expire_stale(&self, timeout: Duration, now: Instant) -> Vec<TenantBinding> {
        let candidates: Vec<TenantId> = self
            .tenants
            .iter()
            .filter(|entry| entry.is_stale(timeout, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::new();
        for tenant in candidates {
            if let Some((_, mut binding)) = self
                .tenants
                .remove_if(&tenant, |_, b| b.is_stale(timeout, now))
            {
                self.backends
                    .remove_if(&binding.connection_id, |_, t| *t == tenant);
                binding.status = PresenceStatus::Offline;
                self.go_offline(&tenant);
                expired.push(binding);
            }
        }
        expired
    }

    /// Unbind a client. Idempotent.
    pub fn remove_client(&self, conn: &ConnectionId) -> Option<ClientBinding> {
        let (_, binding) = self.clients.remove(conn)?;
        self.leave_group(&binding.tenant_id, conn);
        tracing::info!("client disconnected from store: {}", binding.tenant_id);
        Some(binding)
    }

    /// Clients currently in a store's broadcast group.
    pub fn clients_of(&self, tenant: &TenantId) -> Vec<ConnectionId> {
        self.groups
            .get(tenant)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an envelope to every client bound to a store. Returns recipients.
    pub fn broadcast(&self, tenant: &TenantId, envelope: Envelope) -> usize {
        let members = self.clients_of(tenant);
        let mut delivered = 0;
        for conn in members {
            if let Some(handle) = self.connection(&conn) {
                if handle.send(envelope.clone()) {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(
            "broadcast {} to store {}: {} recipients",
            envelope.event,
            tenant,
            delivered
        );
        delivered
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, tenant: &TenantId, by: Duration) {
        if let Some(mut binding) = self.tenants.get_mut(tenant) {
            binding.last_activity = Instant::now() - by;
        }
    }

    fn leave_group(&self, tenant: &TenantId, conn: &ConnectionId) {
        if let Some(mut group) = self.groups.get_mut(tenant) {
            group.remove(conn);
        }
        self.groups.remove_if(tenant, |_, g| g.is_empty());
    }

    fn go_offline(&self, tenant: &TenantId) {
        self.broadcast(tenant, protocol::presence_event(tenant, PresenceStatus::Offline));
        self.queue_status(tenant.clone(), PresenceStatus::Offline);
    }

    /// Persist a presence transition without holding up the caller.
    ///
    /// Updates queue up until a runtime is available to run the persister.
    fn queue_status(&self, tenant: TenantId, status: PresenceStatus) {
        self.start_persister();
        if self.status_tx.send((tenant, status)).is_err() {
            tracing::debug!("status persister gone, dropping {} update", status);
        }
    }

    fn start_persister(&self) {
        let mut slot = self.status_rx.lock();
        if slot.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(mut rx) = slot.take() else {
            return;
        };
        drop(slot);

        let data_service = self.data_service.clone();
        runtime.spawn(async move {
            while let Some((tenant, status)) = rx.recv().await {
                if let Err(e) = data_service.persist_status(&tenant, status).await {
                    tracing::warn!("failed to persist status {} for {}: {:?}", status, tenant, e);
                }
            }
            tracing::debug!("status persister stopped");
        });
    }
}
