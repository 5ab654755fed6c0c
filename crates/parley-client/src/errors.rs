use thiserror::Error;

/// Why the supervisor stopped with an error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("supervisor is not running")]
    Stopped,
}

/// Transport-level failures. Never fatal on their own; they feed the
/// reconnect policy.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}
