//! Adapters Layer
//!
//! Inbound adapters accept peer sockets; outbound adapters implement the
//! domain ports.

pub mod inbound;
pub mod outbound;
