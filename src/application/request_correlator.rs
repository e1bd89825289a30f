//! Request Correlator
//!
//! Tracks client requests forwarded to store backends and routes each backend
//! response back to the client that asked for it. One generic path serves every
//! operation in the operation table.
//!
//! Matching rules:
//! - A response carrying an explicit client id is matched against that
//!   client's queue only (FIFO within the operation type, preferring an entry
//!   whose key equals the response's key).
//! - A response without one falls back to the oldest outstanding request of
//!   that type for the responding store. Concurrent same-type requests from
//!   different clients of one store can then be misrouted; backends should
//!   always echo `client_id`.

use crate::application::connection::DeliveryError;
use crate::application::session_registry::SessionRegistry;
use crate::domain::entities::PendingRequest;
use crate::domain::errors::{CorrelationMiss, RoutingError};
use crate::domain::operations::{self, OperationSpec, TenantSource};
use crate::domain::value_objects::{ConnectionId, TenantId};
use crate::infrastructure::shutdown::ShutdownController;
use crate::protocol::{self, Envelope};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Error delivered to a client whose request outlived the TTL.
const TIMED_OUT: &str = "Request timed out";

#[derive(Default)]
struct PendingTable {
    next_seq: u64,
    /// Per-client queues, each in submission order
    queues: HashMap<ConnectionId, VecDeque<PendingRequest>>,
}

impl PendingTable {
    fn push(
        &mut self,
        client: &ConnectionId,
        tenant: &TenantId,
        op: &'static OperationSpec,
        key: Option<String>,
    ) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.queues
            .entry(client.clone())
            .or_default()
            .push_back(PendingRequest {
                seq,
                client_connection_id: client.clone(),
                tenant_id: tenant.clone(),
                operation_type: op.name,
                key,
                submitted_at: Instant::now(),
            });
        seq
    }

    fn remove_seq(&mut self, client: &ConnectionId, seq: u64) -> Option<PendingRequest> {
        let queue = self.queues.get_mut(client)?;
        let pos = queue.iter().position(|r| r.seq == seq)?;
        let req = queue.remove(pos);
        self.prune(client);
        req
    }

    fn take_for_client(
        &mut self,
        client: &ConnectionId,
        tenant: &TenantId,
        op: &str,
        key: Option<&str>,
    ) -> Option<PendingRequest> {
        let queue = self.queues.get_mut(client)?;
        let matches = |r: &PendingRequest| r.tenant_id == *tenant && r.operation_type == op;
        let pos = key
            .and_then(|k| {
                queue
                    .iter()
                    .position(|r| matches(r) && r.key.as_deref() == Some(k))
            })
            .or_else(|| queue.iter().position(|r| matches(r)))?;
        let req = queue.remove(pos);
        self.prune(client);
        req
    }

    fn take_oldest(&mut self, tenant: &TenantId, op: &str) -> Option<PendingRequest> {
        let (client, pos) = self
            .queues
            .iter()
            .filter_map(|(client, queue)| {
                queue
                    .iter()
                    .position(|r| r.tenant_id == *tenant && r.operation_type == op)
                    .map(|pos| (queue[pos].seq, client, pos))
            })
            .min_by_key(|(seq, _, _)| *seq)
            .map(|(_, client, pos)| (client.clone(), pos))?;
        let req = self.queues.get_mut(&client)?.remove(pos);
        self.prune(&client);
        req
    }

    fn prune(&mut self, client: &ConnectionId) {
        if self.queues.get(client).is_some_and(|q| q.is_empty()) {
            self.queues.remove(client);
        }
    }
}

pub struct RequestCorrelator {
    registry: Arc<SessionRegistry>,
    pending: Mutex<PendingTable>,
}

impl RequestCorrelator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(PendingTable::default()),
        }
    }

    /// Record a client request and forward it to the store's backend.
    ///
    /// The pending entry is recorded before forwarding so a fast response can
    /// never overtake it.
    pub fn submit(
        &self,
        client: &ConnectionId,
        op: &'static OperationSpec,
        payload: Value,
    ) -> Result<(), RoutingError> {
        let tenant = match op.tenant_source {
            TenantSource::ClientBinding => self
                .registry
                .resolve_tenant(client)
                .ok_or(RoutingError::NotBound)?,
            TenantSource::Payload => protocol::string_field(&payload, "store_code")
                .or_else(|| protocol::string_field(&payload, "tenant_id"))
                .map(TenantId::new)
                .ok_or(RoutingError::MissingField("store_code"))?,
        };

        let key = match op.key_field {
            Some(field) => Some(
                protocol::key_field(&payload, field).ok_or(RoutingError::MissingField(field))?,
            ),
            None => None,
        };

        let backend = self
            .registry
            .resolve_backend(&tenant)
            .ok_or(RoutingError::BackendOffline)?;

        let seq = self.pending.lock().push(client, &tenant, op, key);

        let forwarded = Envelope::new(op.backend_event, protocol::with_client_id(payload, client));
        if let Err(e) = backend.try_deliver(forwarded) {
            self.pending.lock().remove_seq(client, seq);
            return Err(match e {
                DeliveryError::Full => RoutingError::BackendBusy,
                DeliveryError::Closed => RoutingError::BackendOffline,
            });
        }

        tracing::debug!(
            "forwarded {} from client {} to store {}",
            op.request_event,
            client,
            tenant
        );
        Ok(())
    }

    /// Route a backend response to the client that is waiting for it.
    ///
    /// `from_tenant` is the store whose backend sent the response; requests of
    /// other stores are never matched.
    pub fn match_and_deliver(
        &self,
        from_tenant: &TenantId,
        op: &'static OperationSpec,
        payload: Value,
        explicit_client: Option<ConnectionId>,
    ) -> Result<ConnectionId, CorrelationMiss> {
        let response_key = op.key_field.and_then(|f| protocol::key_field(&payload, f));

        let taken = {
            let mut table = self.pending.lock();
            match &explicit_client {
                Some(client) => {
                    table.take_for_client(client, from_tenant, op.name, response_key.as_deref())
                }
                None => table.take_oldest(from_tenant, op.name),
            }
        };

        let request = taken.ok_or_else(|| match &explicit_client {
            Some(client) => {
                CorrelationMiss::new(op.name, format!("nothing outstanding for client {}", client))
            }
            None => CorrelationMiss::new(op.name, format!("no client of store {} waiting", from_tenant)),
        })?;

        let client = request.client_connection_id;
        let handle = self.registry.connection(&client).ok_or_else(|| {
            CorrelationMiss::new(op.name, format!("client {} disconnected", client))
        })?;

        if explicit_client.is_none() {
            tracing::debug!(
                "{} without client id matched by submission order to {}",
                op.name,
                client
            );
        }
        handle.send(Envelope::new(op.client_event, payload));
        tracing::debug!("relayed {} to client {}", op.client_event, client);
        Ok(client)
    }

    /// Forget everything a disconnecting client was waiting for.
    pub fn discard_client(&self, client: &ConnectionId) -> usize {
        self.pending
            .lock()
            .queues
            .remove(client)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Snapshot of a client's outstanding requests, oldest first.
    pub fn pending_for(&self, client: &ConnectionId) -> Vec<PendingRequest> {
        self.pending
            .lock()
            .queues
            .get(client)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().queues.values().map(VecDeque::len).sum()
    }

    /// Drop requests older than `ttl` and tell their clients they timed out.
    pub fn expire(&self, ttl: Duration, now: Instant) -> Vec<PendingRequest> {
        let mut expired = Vec::new();
        {
            let mut table = self.pending.lock();
            for queue in table.queues.values_mut() {
                queue.retain(|r| {
                    if r.is_expired(ttl, now) {
                        expired.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            table.queues.retain(|_, q| !q.is_empty());
        }

        for req in &expired {
            let Some(op) = operations::by_name(req.operation_type) else {
                continue;
            };
            if let Some(handle) = self.registry.connection(&req.client_connection_id) {
                handle.send(Envelope::new(op.client_event, op.error_payload(TIMED_OUT)));
            }
        }
        expired
    }

    /// Start the background expiry sweep.
    pub fn start_expiry_sweep(
        self: Arc<Self>,
        ttl: Duration,
        interval: Duration,
        shutdown: ShutdownController,
    ) -> JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = self.expire(ttl, Instant::now());
                        if !expired.is_empty() {
                            tracing::info!("expired {} pending requests", expired.len());
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!("pending request sweep stopped");
        })
    }
}
