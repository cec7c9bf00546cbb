//! WebSocket connections, the saga registry, and fan-out.

pub mod connection;
pub mod lifecycle;
pub mod origin;
pub mod registry;
