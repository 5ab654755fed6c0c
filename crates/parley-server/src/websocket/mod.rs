//! WebSocket connection state and session loop.

pub mod connection;
pub mod session;
