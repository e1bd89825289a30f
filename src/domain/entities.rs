//! Domain Entities - Core routing state
//!
//! These entities are the ephemeral session and correlation records the relay
//! keeps in memory. Nothing here survives a restart; everything is rebuilt
//! from live connections.

use crate::domain::value_objects::{ConnectionId, PresenceStatus, TenantId};
use std::fmt;
use std::time::{Duration, Instant};

/// The single authenticated backend connection of a store.
#[derive(Debug, Clone)]
pub struct TenantBinding {
    pub tenant_id: TenantId,
    pub connection_id: ConnectionId,
    /// Last time anything was received from the backend
    pub last_activity: Instant,
    pub status: PresenceStatus,
}

impl TenantBinding {
    pub fn new(tenant_id: TenantId, connection_id: ConnectionId) -> Self {
        Self {
            tenant_id,
            connection_id,
            last_activity: Instant::now(),
            status: PresenceStatus::Online,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the backend has been silent for longer than `timeout` at `now`.
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// A mobile client bound to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBinding {
    pub client_connection_id: ConnectionId,
    pub tenant_id: TenantId,
}

impl ClientBinding {
    pub fn new(client_connection_id: ConnectionId, tenant_id: TenantId) -> Self {
        Self {
            client_connection_id,
            tenant_id,
        }
    }
}

/// A client request forwarded to a backend and still awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Global submission order, used by the legacy scan fallback
    pub seq: u64,
    pub client_connection_id: ConnectionId,
    pub tenant_id: TenantId,
    pub operation_type: &'static str,
    pub key: Option<String>,
    pub submitted_at: Instant,
}

impl PendingRequest {
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.submitted_at) > ttl
    }
}

/// An authentication exchange waiting for the store backend's verdict.
#[derive(Clone)]
pub struct PendingLogin {
    pub tenant_id: TenantId,
    pub username: String,
    pub password: String,
    pub started_at: Instant,
}

impl PendingLogin {
    pub fn new(tenant_id: TenantId, username: String, password: String) -> Self {
        Self {
            tenant_id,
            username,
            password,
            started_at: Instant::now(),
        }
    }
}

impl fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLogin")
            .field("tenant_id", &self.tenant_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_binding_starts_online() {
        let b = TenantBinding::new("S1".into(), "conn-1".into());
        assert_eq!(b.status, PresenceStatus::Online);
        assert!(!b.is_stale(Duration::from_secs(1), Instant::now()));
    }

    #[test]
    fn test_tenant_binding_staleness() {
        let mut b = TenantBinding::new("S1".into(), "conn-1".into());
        b.last_activity = Instant::now() - Duration::from_secs(100);
        assert!(b.is_stale(Duration::from_secs(50), Instant::now()));

        b.touch();
        assert!(!b.is_stale(Duration::from_secs(50), Instant::now()));
    }

    #[test]
    fn test_staleness_is_strictly_greater_than_timeout() {
        let b = TenantBinding::new("S1".into(), "conn-1".into());
        let at_timeout = b.last_activity + Duration::from_secs(10);
        assert!(!b.is_stale(Duration::from_secs(10), at_timeout));
        assert!(b.is_stale(
            Duration::from_secs(10),
            at_timeout + Duration::from_millis(1)
        ));
    }

    #[test]
    fn test_pending_request_expiry() {
        let req = PendingRequest {
            seq: 1,
            client_connection_id: "c1".into(),
            tenant_id: "S1".into(),
            operation_type: "products",
            key: None,
            submitted_at: Instant::now() - Duration::from_secs(30),
        };
        assert!(req.is_expired(Duration::from_secs(10), Instant::now()));
        assert!(!req.is_expired(Duration::from_secs(60), Instant::now()));
    }

    #[test]
    fn test_pending_login_debug_hides_password() {
        let login = PendingLogin::new("S1".into(), "alice".into(), "hunter2".into());
        let debug = format!("{:?}", login);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }
}
