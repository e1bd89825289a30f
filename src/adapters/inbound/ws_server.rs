//! WebSocket Server Adapter
//!
//! Accepts store backends and mobile clients on `GET /ws` and feeds their
//! frames to the relay service. Each socket gets a reader loop (this task)
//! and a writer task draining the connection's outbound queue.

use crate::application::{ConnectionHandle, RelayService};
use crate::domain::value_objects::ConnectionId;
use crate::infrastructure::shutdown::ShutdownController;
use crate::protocol::{self, Envelope};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

/// How long a closing socket may keep flushing queued frames.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct WsState {
    service: Arc<RelayService>,
    queue_capacity: usize,
    shutdown: ShutdownController,
}

/// WebSocket server - inbound adapter for stores and clients.
pub struct WsServer {
    listen_addr: String,
    state: WsState,
}

impl WsServer {
    pub fn new(
        service: Arc<RelayService>,
        listen_addr: String,
        queue_capacity: usize,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            listen_addr,
            state: WsState {
                service,
                queue_capacity: queue_capacity.max(1),
                shutdown,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!("store relay listening on {}", listener.local_addr()?);
        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("store relay stopped accepting connections");
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    if state.shutdown.is_shutdown() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let _guard = state.shutdown.connection_guard();
    let conn = ConnectionId::generate();
    let (tx, rx) = mpsc::channel::<Envelope>(state.queue_capacity);
    state
        .service
        .connect(Arc::new(ConnectionHandle::new(conn.clone(), tx)));

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(conn.clone(), sink, rx));
    let mut writer_finished = false;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                    Ok(envelope) => state.service.handle_message(&conn, envelope).await,
                    Err(e) => tracing::debug!("malformed frame from {}: {}", conn, e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("read error on {}: {}", conn, e);
                    break;
                }
            },
            _ = &mut writer, if !writer_finished => {
                writer_finished = true;
                break;
            }
            _ = state.shutdown.cancelled() => break,
        }
    }

    // Detaching drops the registry's sender, so the writer flushes and ends.
    state.service.disconnect(&conn);
    if !writer_finished && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn write_frames(
    conn: ConnectionId,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let text = match protocol::encode(&envelope) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to encode {} for {}: {}", envelope.event, conn, e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::debug!("write error on {}: {}", conn, e);
            return;
        }
    }
    let _ = sink.close().await;
}
