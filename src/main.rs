//! store-relay - WebSocket relay between mobile clients and store backends
//!
//! This is the composition root that wires together all the components.

use std::sync::Arc;
use store_relay::adapters::inbound::WsServer;
use store_relay::adapters::outbound::SqliteDataService;
use store_relay::application::RelayService;
use store_relay::config::load_config;
use store_relay::infrastructure::{shutdown_signal, ShutdownController};
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    cfg.validate()?;

    tracing::info!(
        "starting store relay listen={} db={} heartbeat={}s timeout={}s",
        cfg.listen_addr,
        cfg.db_path,
        cfg.heartbeat_interval_secs,
        cfg.presence_timeout_secs
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapter: store directory (SQLite)
    let data_service = Arc::new(SqliteDataService::open(&cfg.db_path)?);

    // 2. Application service with its registry, correlator, presence and login relay
    let service = Arc::new(RelayService::with_data_service(data_service, cfg.presence()));

    // 3. Background sweeps
    let shutdown = ShutdownController::new();
    let mut background = vec![service.presence().clone().start(shutdown.clone())];
    match cfg.request_ttl() {
        Some(ttl) => background.push(service.correlator().clone().start_expiry_sweep(
            ttl,
            cfg.request_sweep_interval(),
            shutdown.clone(),
        )),
        None => tracing::info!("pending request expiry disabled"),
    }

    tokio::spawn(shutdown_signal(shutdown.clone()));

    // 4. Inbound adapter
    let server = WsServer::new(
        service.clone(),
        cfg.listen_addr.clone(),
        cfg.outbound_queue,
        shutdown.clone(),
    );
    let result = server.run().await;

    shutdown.shutdown();
    if !shutdown.wait_for_drain(cfg.shutdown_grace()).await {
        tracing::warn!("shutting down with connections still open");
    }
    for task in background {
        let _ = task.await;
    }
    tracing::info!(
        "store relay stopped ({} stores, {} clients bound at exit)",
        service.registry().tenant_count(),
        service.registry().client_count()
    );

    result
}
