//! # parley-client
//!
//! Client side of the turn protocol:
//!
//! - [`ConnectionSupervisor`]: one outbound connection with heartbeat,
//!   watchdog and exponential-backoff reconnect
//! - [`BackoffPolicy`]: reconnect delay schedule
//! - [`Connector`] / [`Transport`]: socket seam, with a `tokio-tungstenite`
//!   implementation and an in-memory one in [`mock`]

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod mock;
pub mod supervisor;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use errors::{SupervisorError, TransportError};
pub use supervisor::{ConnectionStatus, ConnectionSupervisor, SupervisorConfig, SupervisorHandle};
pub use transport::{Connector, Transport, TransportEvent, WsConnector, NORMAL_CLOSE};
