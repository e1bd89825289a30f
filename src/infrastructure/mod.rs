//! Infrastructure Layer
//!
//! Cross-cutting concerns shared by the server and the background tasks.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ConnectionGuard, ShutdownController};
