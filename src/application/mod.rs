//! Application Layer
//!
//! The relay engine: session bindings, request correlation, presence and
//! login relaying, plus the dispatcher that drives them.

pub mod connection;
pub mod login_relay;
pub mod presence_monitor;
pub mod relay_service;
pub mod request_correlator;
pub mod session_registry;

pub use connection::{ConnectionHandle, DeliveryError};
pub use login_relay::LoginRelay;
pub use presence_monitor::{PresenceConfig, PresenceMonitor};
pub use relay_service::RelayService;
pub use request_correlator::RequestCorrelator;
pub use session_registry::{ClientAck, SessionRegistry, TenantAck};
