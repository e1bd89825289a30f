//! Domain Errors
//!
//! Failure taxonomy for the relay. Only `AuthError` and `RoutingError`
//! are ever surfaced to a peer; `CorrelationMiss` is logged and dropped.

/// Tenant (store backend) registration failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing store code or auth code")]
    MissingFields,
    #[error("Invalid store code or auth code")]
    InvalidCredentials,
    #[error("Database error: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Whether retrying the same credentials later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A client request could not be routed to a store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Not registered for a store")]
    NotBound,
    #[error("Store backend not connected")]
    BackendOffline,
    /// The backend is online but its outbound queue is full.
    #[error("Store backend busy")]
    BackendBusy,
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// A backend response had no outstanding request to answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no pending {operation} request: {reason}")]
pub struct CorrelationMiss {
    pub operation: &'static str,
    pub reason: String,
}

impl CorrelationMiss {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}
