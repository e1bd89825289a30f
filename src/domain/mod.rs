//! Domain Layer
//!
//! Routing state, identifiers, the operation table, and the outbound ports
//! the application layer depends on.

pub mod entities;
pub mod errors;
pub mod operations;
pub mod ports;
pub mod value_objects;

pub use entities::{ClientBinding, PendingLogin, PendingRequest, TenantBinding};
pub use errors::{AuthError, CorrelationMiss, RoutingError};
pub use operations::{OperationSpec, TenantSource, OPERATIONS};
pub use value_objects::{ConnectionId, PresenceStatus, TenantId};
