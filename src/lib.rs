//! store-relay Library
//!
//! Relays requests between mobile clients and the single live backend of each
//! store, tracks store presence, and provides the connector a store backend
//! runs to join the relay. Exposed as a library for integration tests and for
//! backend processes embedding the connector.

pub mod adapters;
pub mod application;
pub mod config;
pub mod connector;
pub mod domain;
pub mod infrastructure;
pub mod protocol;

// Re-export commonly used types
pub use adapters::inbound::WsServer;
pub use adapters::outbound::{MemoryDataService, SqliteDataService};
pub use application::{
    LoginRelay, PresenceConfig, PresenceMonitor, RelayService, RequestCorrelator, SessionRegistry,
};
pub use config::{load_config, Config, ConfigError};
pub use connector::{BackendConnector, ConnectorConfig, ConnectorError, LoginVerdict, RequestHandler};
pub use domain::errors::{AuthError, CorrelationMiss, RoutingError};
pub use domain::ports::DataService;
pub use domain::value_objects::{ConnectionId, PresenceStatus, TenantId};
pub use infrastructure::ShutdownController;
pub use protocol::Envelope;
