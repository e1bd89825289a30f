//! Login Relay
//!
//! Single-shot correlation for credential checks. Only one login can be
//! outstanding per client, so pending logins are keyed by client connection
//! instead of being queued by type.

use crate::application::connection::DeliveryError;
use crate::application::session_registry::SessionRegistry;
use crate::domain::entities::PendingLogin;
use crate::domain::errors::{CorrelationMiss, RoutingError};
use crate::domain::value_objects::{ConnectionId, TenantId};
use crate::protocol::{self, Envelope, LoginResult};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

const OPERATION: &str = "login";

pub struct LoginRelay {
    registry: Arc<SessionRegistry>,
    pending: DashMap<ConnectionId, PendingLogin>,
}

impl LoginRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
        }
    }

    /// Forward a client's credentials to its store backend.
    ///
    /// A new attempt overwrites whatever login the client still had pending.
    pub fn start_login(
        &self,
        client: &ConnectionId,
        tenant: TenantId,
        username: String,
        password: String,
    ) -> Result<(), RoutingError> {
        let backend = self
            .registry
            .resolve_backend(&tenant)
            .ok_or(RoutingError::BackendOffline)?;

        let request = protocol::with_client_id(
            json!({ "username": username, "password": password }),
            client,
        );
        let previous = self
            .pending
            .insert(client.clone(), PendingLogin::new(tenant.clone(), username, password));
        if previous.is_some() {
            tracing::debug!("client {} restarted its login", client);
        }

        if let Err(e) = backend.try_deliver(Envelope::new(protocol::LOGIN_REQUEST, request)) {
            // the earlier attempt already reached the backend and may still be answered
            match previous {
                Some(prev) => {
                    self.pending.insert(client.clone(), prev);
                }
                None => {
                    self.pending.remove(client);
                }
            }
            return Err(match e {
                DeliveryError::Full => RoutingError::BackendBusy,
                DeliveryError::Closed => RoutingError::BackendOffline,
            });
        }

        tracing::info!("login forwarded to store {} for client {}", tenant, client);
        Ok(())
    }

    /// Deliver a backend's verdict to the client that asked for it.
    ///
    /// `from_tenant` is the store whose backend answered; a verdict for a
    /// login aimed at another store is a miss.
    pub async fn complete_login(
        &self,
        from_tenant: &TenantId,
        result: LoginResult,
    ) -> Result<ConnectionId, CorrelationMiss> {
        let client = result
            .client()
            .ok_or_else(|| CorrelationMiss::new(OPERATION, "result carries no client id"))?;

        let (_, login) = self
            .pending
            .remove_if(&client, |_, login| login.tenant_id == *from_tenant)
            .ok_or_else(|| {
                CorrelationMiss::new(
                    OPERATION,
                    format!("no login from client {} to store {}", client, from_tenant),
                )
            })?;

        let store_name = match self
            .registry
            .data_service()
            .tenant_display_name(&login.tenant_id)
            .await
        {
            Ok(name) => name.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("store name lookup failed for {}: {:?}", login.tenant_id, e);
                String::new()
            }
        };

        let handle = self.registry.connection(&client).ok_or_else(|| {
            CorrelationMiss::new(OPERATION, format!("client {} disconnected", client))
        })?;

        tracing::info!(
            "login for {} at store {}: success={}",
            login.username,
            login.tenant_id,
            result.success
        );
        handle.send(Envelope::new(
            protocol::LOGIN_RESULT,
            json!({
                "success": result.success,
                "error": result.error,
                "user_info": result.user_info.unwrap_or(Value::Null),
                "store_name": store_name,
            }),
        ));
        Ok(client)
    }

    /// Drop a disconnecting client's pending login.
    pub fn discard(&self, client: &ConnectionId) -> Option<PendingLogin> {
        self.pending.remove(client).map(|(_, login)| login)
    }

    pub fn is_pending(&self, client: &ConnectionId) -> bool {
        self.pending.contains_key(client)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryDataService;
    use crate::application::connection::ConnectionHandle;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        data: Arc<MemoryDataService>,
        logins: LoginRelay,
    }

    impl Fixture {
        async fn new() -> Self {
            let data = Arc::new(
                MemoryDataService::new()
                    .with_store("S1", "secret", "Store One")
                    .with_store("S2", "other", "Store Two"),
            );
            let registry = Arc::new(SessionRegistry::new(data.clone()));
            let logins = LoginRelay::new(registry.clone());
            Self {
                registry,
                data,
                logins,
            }
        }

        fn connect(&self, id: &str) -> mpsc::Receiver<Envelope> {
            let (tx, rx) = mpsc::channel(16);
            self.registry
                .attach(Arc::new(ConnectionHandle::new(id.into(), tx)));
            rx
        }

        async fn backend(&self, id: &str, store: &str, auth: &str) -> mpsc::Receiver<Envelope> {
            let rx = self.connect(id);
            self.registry
                .register_tenant(store.into(), auth, &id.into())
                .await
                .unwrap();
            rx
        }
    }

    fn verdict(client: &str, success: bool) -> LoginResult {
        protocol::parse_payload(&json!({
            "client_id": client,
            "success": success,
            "error": if success { Value::Null } else { json!("Bad password") },
            "user_info": {"username": "alice", "role": "admin"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_login_requires_online_backend() {
        let f = Fixture::new().await;
        let _c = f.connect("c1");

        let err = f
            .logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw".into())
            .unwrap_err();
        assert_eq!(err, RoutingError::BackendOffline);
        assert!(!f.logins.is_pending(&"c1".into()));
    }

    #[tokio::test]
    async fn test_start_login_forwards_credentials() {
        let f = Fixture::new().await;
        let mut b = f.backend("b1", "S1", "secret").await;
        let _c = f.connect("c1");

        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw".into())
            .unwrap();

        let env = b.try_recv().unwrap();
        assert_eq!(env.event, protocol::LOGIN_REQUEST);
        assert_eq!(env.data["username"], "alice");
        assert_eq!(env.data["password"], "pw");
        assert_eq!(env.data["client_id"], "c1");
        assert_eq!(env.data["client_sid"], "c1");
        assert_eq!(f.logins.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_login_enriches_with_store_name() {
        let f = Fixture::new().await;
        let _b = f.backend("b1", "S1", "secret").await;
        let mut c = f.connect("c1");
        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw".into())
            .unwrap();

        let delivered = f
            .logins
            .complete_login(&"S1".into(), verdict("c1", true))
            .await
            .unwrap();

        assert_eq!(delivered, ConnectionId::new("c1"));
        let env = c.try_recv().unwrap();
        assert_eq!(env.event, protocol::LOGIN_RESULT);
        assert_eq!(env.data["success"], true);
        assert_eq!(env.data["store_name"], "Store One");
        assert_eq!(env.data["user_info"]["role"], "admin");
        assert!(!f.logins.is_pending(&"c1".into()));
    }

    #[tokio::test]
    async fn test_failed_login_carries_error() {
        let f = Fixture::new().await;
        let _b = f.backend("b1", "S1", "secret").await;
        let mut c = f.connect("c1");
        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "nope".into())
            .unwrap();

        f.logins
            .complete_login(&"S1".into(), verdict("c1", false))
            .await
            .unwrap();

        let env = c.try_recv().unwrap();
        assert_eq!(env.data["success"], false);
        assert_eq!(env.data["error"], "Bad password");
    }

    #[tokio::test]
    async fn test_store_name_lookup_failure_yields_empty_name() {
        let f = Fixture::new().await;
        let _b = f.backend("b1", "S1", "secret").await;
        let mut c = f.connect("c1");
        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw".into())
            .unwrap();

        f.data.set_available(false);
        f.logins
            .complete_login(&"S1".into(), verdict("c1", true))
            .await
            .unwrap();

        assert_eq!(c.try_recv().unwrap().data["store_name"], "");
    }

    #[tokio::test]
    async fn test_new_attempt_overwrites_pending_login() {
        let f = Fixture::new().await;
        let _b = f.backend("b1", "S1", "secret").await;
        let _c = f.connect("c1");

        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw1".into())
            .unwrap();
        f.logins
            .start_login(&"c1".into(), "S1".into(), "bob".into(), "pw2".into())
            .unwrap();

        assert_eq!(f.logins.pending_count(), 1);
        assert_eq!(f.logins.discard(&"c1".into()).unwrap().username, "bob");
    }

    #[tokio::test]
    async fn test_undelivered_retry_keeps_earlier_attempt() {
        let f = Fixture::new().await;
        let (tx, _b) = mpsc::channel(1);
        f.registry
            .attach(Arc::new(ConnectionHandle::new("b1".into(), tx)));
        f.registry
            .register_tenant("S1".into(), "secret", &"b1".into())
            .await
            .unwrap();
        let _c = f.connect("c1");

        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw1".into())
            .unwrap();
        let err = f
            .logins
            .start_login(&"c1".into(), "S1".into(), "bob".into(), "pw2".into())
            .unwrap_err();

        assert_eq!(err, RoutingError::BackendBusy);
        assert_eq!(f.logins.discard(&"c1".into()).unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_late_result_after_disconnect_is_dropped() {
        let f = Fixture::new().await;
        let _b = f.backend("b1", "S1", "secret").await;
        let _c = f.connect("c1");
        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw".into())
            .unwrap();

        assert!(f.logins.discard(&"c1".into()).is_some());
        f.registry.detach(&"c1".into());

        assert!(f
            .logins
            .complete_login(&"S1".into(), verdict("c1", true))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_result_from_other_store_is_a_miss() {
        let f = Fixture::new().await;
        let _b1 = f.backend("b1", "S1", "secret").await;
        let _b2 = f.backend("b2", "S2", "other").await;
        let mut c = f.connect("c1");
        f.logins
            .start_login(&"c1".into(), "S1".into(), "alice".into(), "pw".into())
            .unwrap();

        let miss = f
            .logins
            .complete_login(&"S2".into(), verdict("c1", true))
            .await
            .unwrap_err();
        assert_eq!(miss.operation, "login");
        assert!(f.logins.is_pending(&"c1".into()));
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_result_without_client_id_is_a_miss() {
        let f = Fixture::new().await;
        let result: LoginResult = protocol::parse_payload(&json!({"success": true})).unwrap();
        assert!(f.logins.complete_login(&"S1".into(), result).await.is_err());
    }
}
