//! Relay Service - Main application use case
//!
//! Dispatches every inbound envelope to the registry, the correlator or the
//! login relay, and cleans up after a closing connection. This is the only
//! interface the inbound adapter talks to.

use crate::application::connection::ConnectionHandle;
use crate::application::login_relay::LoginRelay;
use crate::application::presence_monitor::{PresenceConfig, PresenceMonitor};
use crate::application::request_correlator::RequestCorrelator;
use crate::application::session_registry::SessionRegistry;
use crate::domain::operations::{self, OperationSpec};
use crate::domain::ports::DataService;
use crate::domain::value_objects::{ConnectionId, TenantId};
use crate::protocol::{self, Envelope};
use serde_json::{json, Value};
use std::sync::Arc;

/// Relay service - main application use case.
///
/// One instance is shared by every connection task.
pub struct RelayService {
    registry: Arc<SessionRegistry>,
    correlator: Arc<RequestCorrelator>,
    presence: Arc<PresenceMonitor>,
    logins: Arc<LoginRelay>,
}

impl RelayService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        correlator: Arc<RequestCorrelator>,
        presence: Arc<PresenceMonitor>,
        logins: Arc<LoginRelay>,
    ) -> Self {
        Self {
            registry,
            correlator,
            presence,
            logins,
        }
    }

    /// Wire up a full relay around one data service.
    pub fn with_data_service(data_service: Arc<dyn DataService>, presence: PresenceConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(data_service));
        Self::new(
            registry.clone(),
            Arc::new(RequestCorrelator::new(registry.clone())),
            Arc::new(PresenceMonitor::new(registry.clone(), presence)),
            Arc::new(LoginRelay::new(registry)),
        )
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn presence(&self) -> &Arc<PresenceMonitor> {
        &self.presence
    }

    pub fn logins(&self) -> &Arc<LoginRelay> {
        &self.logins
    }

    /// A socket was accepted.
    pub fn connect(&self, handle: Arc<ConnectionHandle>) {
        tracing::debug!("connection opened: {}", handle.id());
        self.registry.attach(handle);
    }

    /// Process one inbound envelope from `conn`.
    pub async fn handle_message(&self, conn: &ConnectionId, envelope: Envelope) {
        // any traffic from a backend counts as a heartbeat
        let from_backend = self.presence.record_activity(conn);
        let Envelope { event, data } = envelope;

        match event.as_str() {
            protocol::REGISTER_STORE => self.on_register_store(conn, &data).await,
            protocol::REGISTER_CLIENT => self.on_register_client(conn, &data).await,
            protocol::LOGIN => self.on_login(conn, &data),
            protocol::LOGIN_RESULT | protocol::LOGIN_RESPONSE_LEGACY => {
                self.on_login_result(conn, from_backend, &data).await
            }
            protocol::HEARTBEAT => self.on_heartbeat(conn, from_backend),
            other => {
                if let Some(op) = operations::by_request_event(other) {
                    self.on_request(conn, op, data);
                } else if let Some(op) = operations::by_response_event(other) {
                    self.on_response(conn, from_backend, op, data);
                } else {
                    tracing::debug!("ignoring unknown event {} from {}", other, conn);
                }
            }
        }
    }

    /// A socket closed. Drops every piece of routing state it owned.
    pub fn disconnect(&self, conn: &ConnectionId) {
        self.registry.remove_backend_connection(conn);
        self.registry.remove_client(conn);
        let dropped = self.correlator.discard_client(conn);
        if dropped > 0 {
            tracing::debug!("discarded {} pending requests of {}", dropped, conn);
        }
        self.logins.discard(conn);
        self.registry.detach(conn);
        tracing::debug!("connection closed: {}", conn);
    }

    async fn on_register_store(&self, conn: &ConnectionId, data: &Value) {
        let reg: protocol::RegisterStore = match protocol::parse_payload(data) {
            Ok(reg) => reg,
            Err(e) => {
                tracing::debug!("malformed register_store from {}: {}", conn, e);
                self.reply(conn, protocol::REGISTER_STORE_RESPONSE, protocol::error_payload("Malformed registration"));
                return;
            }
        };

        let tenant = TenantId::new(reg.store_code.unwrap_or_default());
        let auth_code = reg.auth_code.unwrap_or_default();

        match self.registry.register_tenant(tenant, &auth_code, conn).await {
            Ok(ack) => self.reply(
                conn,
                protocol::REGISTER_STORE_RESPONSE,
                json!({
                    "success": true,
                    "store_code": ack.tenant_id.as_str(),
                    // whole seconds for older backends; millis is exact
                    "heartbeat_interval_secs": self.presence.config().heartbeat_interval.as_secs(),
                    "heartbeat_interval_ms": self.presence.config().heartbeat_interval.as_millis() as u64,
                }),
            ),
            Err(e) => {
                tracing::warn!("store registration rejected on {}: {}", conn, e);
                let mut data = protocol::error_payload(&e);
                data["retryable"] = json!(e.is_transient());
                self.reply(conn, protocol::REGISTER_STORE_RESPONSE, data);
            }
        }
    }

    async fn on_register_client(&self, conn: &ConnectionId, data: &Value) {
        let store_code = protocol::parse_payload::<protocol::RegisterClient>(data)
            .ok()
            .and_then(|reg| reg.store_code)
            .filter(|s| !s.is_empty());
        let Some(store_code) = store_code else {
            self.reply(conn, protocol::REGISTER_CLIENT_RESPONSE, protocol::error_payload("Missing store code"));
            return;
        };

        let ack = self.registry.register_client(TenantId::new(store_code), conn);
        let store_name = self.store_name(&ack.tenant_id).await;
        self.reply(
            conn,
            protocol::REGISTER_CLIENT_RESPONSE,
            json!({
                "success": true,
                "store_code": ack.tenant_id.as_str(),
                "store_name": store_name,
                "backend_online": ack.backend_online,
            }),
        );
    }

    fn on_login(&self, conn: &ConnectionId, data: &Value) {
        let login = protocol::parse_payload::<protocol::Login>(data).ok();
        let fields = login.and_then(|l| {
            let store = l.store_code.filter(|s| !s.is_empty())?;
            let username = l.username.filter(|s| !s.is_empty())?;
            let password = l.password.filter(|s| !s.is_empty())?;
            Some((store, username, password))
        });
        let Some((store, username, password)) = fields else {
            self.reply(conn, protocol::LOGIN_RESULT, protocol::error_payload("Missing fields"));
            return;
        };

        if let Err(e) = self
            .logins
            .start_login(conn, TenantId::new(store), username, password)
        {
            self.reply(conn, protocol::LOGIN_RESULT, protocol::error_payload(e));
        }
    }

    async fn on_login_result(&self, conn: &ConnectionId, from_backend: Option<TenantId>, data: &Value) {
        let Some(tenant) = from_backend else {
            tracing::warn!("login result from unregistered connection {}", conn);
            return;
        };
        let result: protocol::LoginResult = match protocol::parse_payload(data) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("malformed login result from store {}: {}", tenant, e);
                return;
            }
        };
        if let Err(miss) = self.logins.complete_login(&tenant, result).await {
            tracing::debug!("dropping login result from store {}: {}", tenant, miss);
        }
    }

    fn on_heartbeat(&self, conn: &ConnectionId, from_backend: Option<TenantId>) {
        match from_backend {
            Some(tenant) => self.reply(
                conn,
                protocol::HEARTBEAT_RESPONSE,
                json!({ "success": true, "store_code": tenant.as_str() }),
            ),
            None => {
                tracing::debug!("heartbeat from unregistered connection {}", conn);
                self.reply(conn, protocol::HEARTBEAT_RESPONSE, protocol::error_payload("Store not registered"));
            }
        }
    }

    fn on_request(&self, conn: &ConnectionId, op: &'static OperationSpec, data: Value) {
        if let Err(e) = self.correlator.submit(conn, op, data) {
            tracing::debug!("{} from {} rejected: {}", op.request_event, conn, e);
            self.reply(conn, op.client_event, op.error_payload(e));
        }
    }

    fn on_response(
        &self,
        conn: &ConnectionId,
        from_backend: Option<TenantId>,
        op: &'static OperationSpec,
        data: Value,
    ) {
        let Some(tenant) = from_backend else {
            tracing::warn!("{} from unregistered connection {} dropped", op.name, conn);
            return;
        };
        let explicit = protocol::explicit_client_id(&data);
        if let Err(miss) = self.correlator.match_and_deliver(&tenant, op, data, explicit) {
            tracing::debug!("dropping response from store {}: {}", tenant, miss);
        }
    }

    async fn store_name(&self, tenant: &TenantId) -> String {
        match self.registry.data_service().tenant_display_name(tenant).await {
            Ok(name) => name.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("store name lookup failed for {}: {:?}", tenant, e);
                String::new()
            }
        }
    }

    fn reply(&self, conn: &ConnectionId, event: &str, data: Value) {
        if let Some(handle) = self.registry.connection(conn) {
            handle.send(Envelope::new(event, data));
        }
    }
}
