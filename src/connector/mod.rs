//! Backend Connector
//!
//! What a store backend process runs to serve its store through the relay:
//! connect, register, heartbeat, answer relayed requests, and reconnect with
//! backoff whenever the link drops.
//!
//! ```text
//! DISCONNECTED --connect--> REGISTERING --ack--> SERVING
//!      ^                        |                   |
//!      +------- backoff --------+---- link lost ----+
//! ```
//!
//! An explicit credential rejection is terminal; everything else is retried
//! forever.

mod backoff;

pub use backoff::{BackoffConfig, ReconnectBackoff};

use crate::domain::operations::{self, OperationSpec};
use crate::domain::value_objects::{ConnectionId, TenantId};
use crate::infrastructure::shutdown::ShutdownController;
use crate::protocol::{self, Envelope};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The relay refused our credentials. Never retried.
    #[error("registration rejected: {0}")]
    Rejected(String),
    /// The relay could not check our credentials right now.
    #[error("registration deferred: {0}")]
    Unavailable(String),
    #[error("no registration response within {0:?}")]
    RegisterTimeout(Duration),
    #[error("relay closed the connection")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Relay endpoint, e.g. `ws://relay:5000/ws`
    pub url: String,
    pub store_code: String,
    pub auth_code: String,
    /// Local heartbeat period; a shorter period advertised by the relay wins
    pub heartbeat_interval: Duration,
    pub register_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl ConnectorConfig {
    pub fn new(
        url: impl Into<String>,
        store_code: impl Into<String>,
        auth_code: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            store_code: store_code.into(),
            auth_code: auth_code.into(),
            heartbeat_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

/// A backend's verdict on a relayed login.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginVerdict {
    pub success: bool,
    pub error: Option<String>,
    pub user_info: Option<Value>,
}

impl LoginVerdict {
    pub fn accepted(user_info: Value) -> Self {
        Self {
            success: true,
            error: None,
            user_info: Some(user_info),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            user_info: None,
        }
    }
}

/// Business side of a store backend.
///
/// Each relayed request runs on its own task, so implementations must be
/// safe to call concurrently.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one relayed request. Errors are sent back to the client as
    /// `{"success": false, "error"}`.
    async fn handle(
        &self,
        store: &TenantId,
        operation: &'static OperationSpec,
        payload: Value,
    ) -> anyhow::Result<Value>;

    async fn login(&self, store: &TenantId, username: &str, password: &str) -> anyhow::Result<LoginVerdict> {
        let _ = (store, username, password);
        Ok(LoginVerdict::rejected("Login not supported"))
    }
}

pub struct BackendConnector {
    config: ConnectorConfig,
    handler: Arc<dyn RequestHandler>,
    store: TenantId,
}

impl BackendConnector {
    pub fn new(config: ConnectorConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let store = TenantId::new(config.store_code.clone());
        Self {
            config,
            handler,
            store,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Serve the store until shutdown or until the relay rejects us.
    pub async fn run(&self, shutdown: ShutdownController) -> Result<(), ConnectorError> {
        let mut backoff = ReconnectBackoff::new(self.config.backoff.clone());

        loop {
            if shutdown.is_shutdown() {
                return Ok(());
            }

            match self.session(&mut backoff, &shutdown).await {
                Ok(()) => return Ok(()),
                Err(ConnectorError::Rejected(reason)) => {
                    tracing::error!("store {} rejected by relay: {}", self.store, reason);
                    return Err(ConnectorError::Rejected(reason));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "relay link for store {} down: {}; retry {} in {:?}",
                        self.store,
                        e,
                        backoff.attempt(),
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    /// One connected session. Ok means shutdown was requested.
    async fn session(
        &self,
        backoff: &mut ReconnectBackoff,
        shutdown: &ShutdownController,
    ) -> Result<(), ConnectorError> {
        let (ws, _) = connect_async(self.config.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        tracing::debug!("connected to relay at {}", self.config.url);

        send(&mut sink, &self.register_envelope()).await?;
        let ack = tokio::time::timeout(self.config.register_timeout, next_envelope(&mut stream))
            .await
            .map_err(|_| ConnectorError::RegisterTimeout(self.config.register_timeout))??;
        let advertised = check_registration(&ack)?;
        backoff.reset();

        let period = effective_heartbeat(self.config.heartbeat_interval, advertised);
        tracing::info!(
            "store {} registered with relay, heartbeat every {:?}",
            self.store,
            period
        );

        let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope>(64);
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    send(&mut sink, &Envelope::new(
                        protocol::HEARTBEAT,
                        json!({ "store_code": self.store.as_str() }),
                    )).await?;
                }
                Some(reply) = reply_rx.recv() => send(&mut sink, &reply).await?,
                envelope = next_envelope(&mut stream) => {
                    self.on_envelope(envelope?, &mut sink, &reply_tx).await?;
                }
            }
        }
    }

    async fn on_envelope(
        &self,
        envelope: Envelope,
        sink: &mut WsSink,
        replies: &mpsc::Sender<Envelope>,
    ) -> Result<(), ConnectorError> {
        match envelope.event.as_str() {
            protocol::HEARTBEAT_RESPONSE => {
                if envelope.data["success"] == false {
                    tracing::warn!("relay no longer knows store {}, re-registering", self.store);
                    send(sink, &self.register_envelope()).await?;
                }
            }
            protocol::REGISTER_STORE_RESPONSE => {
                check_registration(&envelope)?;
                tracing::info!("store {} re-registered", self.store);
            }
            protocol::LOGIN_REQUEST => self.spawn_login(envelope.data, replies.clone()),
            event => match operations::by_backend_event(event) {
                Some(op) => self.spawn_request(op, envelope.data, replies.clone()),
                None => tracing::debug!("ignoring {} from relay", event),
            },
        }
        Ok(())
    }

    fn spawn_request(&self, op: &'static OperationSpec, payload: Value, replies: mpsc::Sender<Envelope>) {
        let handler = self.handler.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let client = protocol::explicit_client_id(&payload);
            let result = handler.handle(&store, op, payload).await;
            if let Err(e) = &result {
                tracing::warn!("{} failed for store {}: {:?}", op.name, store, e);
            }
            let _ = replies.send(build_reply(op, client.as_ref(), result)).await;
        });
    }

    fn spawn_login(&self, payload: Value, replies: mpsc::Sender<Envelope>) {
        let handler = self.handler.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let Some(client) = protocol::explicit_client_id(&payload) else {
                tracing::debug!("login request without client id");
                return;
            };
            let username = protocol::string_field(&payload, "username").unwrap_or_default();
            let password = protocol::string_field(&payload, "password").unwrap_or_default();
            let verdict = handler
                .login(&store, username, password)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("login check failed for store {}: {:?}", store, e);
                    LoginVerdict::rejected(e.to_string())
                });
            let _ = replies.send(login_reply(&client, verdict)).await;
        });
    }

    fn register_envelope(&self) -> Envelope {
        Envelope::new(
            protocol::REGISTER_STORE,
            json!({
                "store_code": self.config.store_code,
                "auth_code": self.config.auth_code,
            }),
        )
    }
}

async fn send(sink: &mut WsSink, envelope: &Envelope) -> Result<(), ConnectorError> {
    sink.send(Message::text(protocol::encode(envelope)?)).await?;
    Ok(())
}

/// Next well-formed envelope; malformed frames are skipped.
async fn next_envelope(stream: &mut WsSource) -> Result<Envelope, ConnectorError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => tracing::debug!("malformed frame from relay: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ConnectorError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Interpret a `register_store_response`. Returns the advertised heartbeat.
fn check_registration(envelope: &Envelope) -> Result<Option<Duration>, ConnectorError> {
    if envelope.event != protocol::REGISTER_STORE_RESPONSE {
        return Err(ConnectorError::Unavailable(format!(
            "expected {}, got {}",
            protocol::REGISTER_STORE_RESPONSE,
            envelope.event
        )));
    }
    let data = &envelope.data;
    if data["success"] == true {
        let advertised = match data["heartbeat_interval_ms"].as_u64() {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => data["heartbeat_interval_secs"].as_u64().map(Duration::from_secs),
        };
        return Ok(advertised.filter(|period| !period.is_zero()));
    }

    let reason = protocol::string_field(data, "error")
        .unwrap_or("registration failed")
        .to_string();
    if data["retryable"] == true {
        Err(ConnectorError::Unavailable(reason))
    } else {
        Err(ConnectorError::Rejected(reason))
    }
}

fn effective_heartbeat(local: Duration, advertised: Option<Duration>) -> Duration {
    match advertised {
        Some(relay) if relay < local => relay,
        _ => local,
    }
}

/// Reply envelope for one relayed request.
fn build_reply(
    op: &'static OperationSpec,
    client: Option<&ConnectionId>,
    result: anyhow::Result<Value>,
) -> Envelope {
    let data = match result {
        Ok(data) => data,
        Err(e) => op.error_payload(e),
    };
    let data = match client {
        Some(client) => protocol::with_client_id(data, client),
        None => data,
    };
    Envelope::new(op.primary_response_event(), data)
}

fn login_reply(client: &ConnectionId, verdict: LoginVerdict) -> Envelope {
    Envelope::new(
        protocol::LOGIN_RESULT,
        protocol::with_client_id(
            json!({
                "success": verdict.success,
                "error": verdict.error,
                "user_info": verdict.user_info,
            }),
            client,
        ),
    )
}
