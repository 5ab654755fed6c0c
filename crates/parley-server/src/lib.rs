//! # parley-server
//!
//! Axum WebSocket turn server.
//!
//! - Session registry of open connections (`DashMap`)
//! - Protocol dispatch with a per-connection state machine and FIFO turn worker
//! - Heartbeat pings and idle-connection timeout
//! - `/health` endpoint
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use dispatcher::{ConnectionDispatch, Dispatcher, SessionCache};
pub use errors::ServerError;
pub use registry::SessionRegistry;
pub use server::{ParleyServer, SHUTDOWN_NOTICE};
pub use shutdown::ShutdownCoordinator;
