//! Presence Monitor
//!
//! Ages out store backends that stopped talking, independently of transport
//! disconnect notifications. Per store:
//!
//! ```text
//! UNINITIALIZED --register--> ONLINE --timeout / disconnect--> OFFLINE
//! ```
//!
//! Any inbound message from a backend (response or heartbeat) refreshes its
//! activity timestamp. A periodic sweep evicts every binding whose silence
//! exceeds the timeout: the binding is removed, bound clients get one OFFLINE
//! event, and the OFFLINE status is persisted in the background.

use crate::application::session_registry::SessionRegistry;
use crate::domain::value_objects::{ConnectionId, TenantId};
use crate::infrastructure::shutdown::ShutdownController;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Presence timing.
///
/// `timeout / heartbeat_interval` is the number of heartbeats that may be
/// missed before a store is declared offline.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Interval backends are told to heartbeat at
    pub heartbeat_interval: Duration,
    /// Silence after which a backend is evicted
    pub timeout: Duration,
    /// Period of the eviction sweep
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl PresenceConfig {
    /// Heartbeats a backend may miss before eviction.
    pub fn tolerated_missed_heartbeats(&self) -> u32 {
        let hb = self.heartbeat_interval.as_millis().max(1);
        (self.timeout.as_millis() / hb).saturating_sub(1) as u32
    }
}

pub struct PresenceMonitor {
    registry: Arc<SessionRegistry>,
    config: PresenceConfig,
}

impl PresenceMonitor {
    pub fn new(registry: Arc<SessionRegistry>, config: PresenceConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Refresh the activity clock of whatever store `conn` serves.
    pub fn record_activity(&self, conn: &ConnectionId) -> Option<TenantId> {
        let tenant = self.registry.touch_backend(conn);
        if let Some(tenant) = &tenant {
            tracing::trace!("activity from store {}", tenant);
        }
        tenant
    }

    /// Evict every store silent past the timeout. Returns the evicted stores.
    pub fn sweep(&self) -> Vec<TenantId> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<TenantId> {
        let expired = self.registry.expire_stale(self.config.timeout, now);
        expired
            .into_iter()
            .map(|binding| {
                tracing::warn!(
                    "store {} offline: no activity for {:?} (conn {})",
                    binding.tenant_id,
                    now.saturating_duration_since(binding.last_activity),
                    binding.connection_id
                );
                binding.tenant_id
            })
            .collect()
    }

    /// Start the background sweep.
    pub fn start(self: Arc<Self>, shutdown: ShutdownController) -> JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            tracing::info!(
                "presence monitor started: timeout={:?} sweep={:?} heartbeat={:?}",
                self.config.timeout,
                self.config.sweep_interval,
                self.config.heartbeat_interval
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep();
                        if !evicted.is_empty() {
                            tracing::debug!("presence sweep evicted {} stores", evicted.len());
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!("presence monitor stopped");
        })
    }
}
