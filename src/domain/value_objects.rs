//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a store (tenant) served by exactly one backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a single live connection (store backend or mobile client).
///
/// Generated by the inbound adapter when the socket is accepted. It is also
/// the `client_id` a backend echoes back so a response reaches the right client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Backend connectivity of a store as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tenant_id_display_and_equality() {
        let a = TenantId::new("S1");
        let b: TenantId = "S1".into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "S1");
        assert_eq!(a.as_str(), "S1");
    }

    #[test]
    fn test_tenant_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&TenantId::new("S1")).unwrap();
        assert_eq!(json, "\"S1\"");
    }

    #[test]
    fn test_generated_connection_ids_are_unique() {
        let ids: HashSet<ConnectionId> = (0..100).map(|_| ConnectionId::generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_presence_status_wire_form() {
        assert_eq!(PresenceStatus::Online.as_str(), "online");
        assert_eq!(
            serde_json::to_value(PresenceStatus::Offline).unwrap(),
            serde_json::json!("offline")
        );
    }
}
