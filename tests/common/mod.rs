//! Shared harness: a relay on an ephemeral port and raw WebSocket peers.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use store_relay::adapters::inbound::WsServer;
use store_relay::adapters::outbound::MemoryDataService;
use store_relay::application::{PresenceConfig, RelayService};
use store_relay::infrastructure::ShutdownController;
use store_relay::protocol::{self, Envelope};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(3);

pub struct Relay {
    pub url: String,
    pub addr: String,
    pub service: Arc<RelayService>,
    pub data: Arc<MemoryDataService>,
    pub shutdown: ShutdownController,
    pub server: JoinHandle<anyhow::Result<()>>,
}

pub fn test_stores() -> Arc<MemoryDataService> {
    Arc::new(
        MemoryDataService::new()
            .with_store("S1", "secret", "Store One")
            .with_store("S2", "other", "Store Two"),
    )
}

pub async fn start_relay(presence: PresenceConfig) -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    start_relay_on(listener, presence).await
}

pub async fn start_relay_on(listener: TcpListener, presence: PresenceConfig) -> Relay {
    let data = test_stores();
    let service = Arc::new(RelayService::with_data_service(data.clone(), presence));
    let shutdown = ShutdownController::new();
    service.presence().clone().start(shutdown.clone());
    let addr = listener.local_addr().unwrap().to_string();
    let server = WsServer::new(service.clone(), addr.clone(), 64, shutdown.clone());
    let server = tokio::spawn(async move { server.serve(listener).await });

    Relay {
        url: format!("ws://{}/ws", addr),
        addr,
        service,
        data,
        shutdown,
        server,
    }
}

/// Poll until `cond` holds or the wait budget runs out.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A raw WebSocket participant speaking the envelope protocol.
pub struct Peer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Peer {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.unwrap();
        Self { ws }
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let text = protocol::encode(&Envelope::new(event, data)).unwrap();
        self.ws.send(Message::text(text)).await.unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    /// Next envelope, whatever its event.
    pub async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => return protocol::decode(&text).unwrap(),
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended while waiting: {:?}", other),
                }
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Next envelope with the given event, skipping others.
    pub async fn recv_event(&mut self, event: &str) -> Envelope {
        loop {
            let env = self.recv().await;
            if env.event == event {
                return env;
            }
        }
    }

    /// True if nothing arrives within `window`.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.ws.next()).await.is_err()
    }

    /// True once the relay closes the socket.
    pub async fn closed_by_relay(&mut self) -> bool {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Register as the backend of `store` and return the ack.
    pub async fn register_store(&mut self, store: &str, auth: &str) -> Envelope {
        self.send("register_store", serde_json::json!({"store_code": store, "auth_code": auth}))
            .await;
        self.recv_event("register_store_response").await
    }

    /// Register as a client of `store` and return the ack.
    pub async fn register_client(&mut self, store: &str) -> Envelope {
        self.send("register_client", serde_json::json!({"store_code": store}))
            .await;
        self.recv_event("register_client_response").await
    }
}
