//! Keeps one outbound connection alive.
//!
//! While open, a heartbeat sends `ping` every interval and a watchdog closes
//! the transport if nothing arrives within the timeout. Any close other than
//! a normal one (1000) schedules a reconnect with exponential backoff until
//! the attempt cap is reached.

use std::sync::Arc;
use std::time::Duration;

use parley_core::protocol::decode_server_frame;
use parley_core::{ClientFrame, ServerFrame};
use parley_settings::ClientSettings;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::errors::SupervisorError;
use crate::transport::{Connector, Transport, TransportEvent, NORMAL_CLOSE};

/// Close code sent when the watchdog gives up on a silent server.
pub const HEARTBEAT_TIMEOUT_CODE: u16 = 4000;
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

const INBOUND_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// Observable connection status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms.max(1)),
            heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms.max(1)),
            backoff: BackoffPolicy::from_settings(settings),
        }
    }
}

/// Cloneable handle for sending frames and stopping the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    outbound: mpsc::Sender<ClientFrame>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: CancellationToken,
}

impl SupervisorHandle {
    /// Queue a frame. Frames sent while disconnected go out after the next
    /// successful connect.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), SupervisorError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SupervisorError::Stopped)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Status updates.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Close normally and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// How one open connection ended.
#[derive(Debug)]
enum SessionEnd {
    /// Normal close from the server.
    Clean,
    /// Our side asked to stop.
    Stopped,
    /// Anything else; triggers a reconnect.
    Lost(String),
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    config: SupervisorConfig,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::Sender<ServerFrame>,
    outbound: mpsc::Receiver<ClientFrame>,
    greeting: Option<ClientFrame>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    /// Build a supervisor, its handle, and the stream of inbound frames.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: SupervisorConfig,
    ) -> (Self, SupervisorHandle, mpsc::Receiver<ServerFrame>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let shutdown = CancellationToken::new();
        let handle = SupervisorHandle {
            outbound: outbound_tx,
            status: status_rx,
            shutdown: shutdown.clone(),
        };
        let supervisor = Self {
            connector,
            config,
            status: status_tx,
            inbound: inbound_tx,
            outbound: outbound_rx,
            greeting: None,
            shutdown,
        };
        (supervisor, handle, inbound_rx)
    }

    /// Frame sent first on every successful connect, e.g. `initialize`, so a
    /// reconnect rebinds the server-side session.
    pub fn with_greeting(mut self, frame: ClientFrame) -> Self {
        self.greeting = Some(frame);
        self
    }

    /// Run until a normal close, a shutdown request, or the reconnect cap.
    #[instrument(skip_all)]
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let mut attempt: u32 = 0;
        loop {
            self.set_status(ConnectionStatus::Connecting);
            let last_error = match self.connector.connect().await {
                Ok(transport) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Open);
                    info!("connection open");
                    match self.drive(transport).await {
                        SessionEnd::Clean => {
                            info!("server closed the connection normally");
                            self.set_status(ConnectionStatus::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Stopped => {
                            self.set_status(ConnectionStatus::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };
            self.set_status(ConnectionStatus::Disconnected);

            attempt += 1;
            if !self.config.backoff.allows(attempt) {
                let attempts = attempt - 1;
                warn!(attempts, error = %last_error, "giving up on reconnecting");
                return Err(SupervisorError::RetriesExhausted {
                    attempts,
                    last_error,
                });
            }
            let delay = self.config.backoff.delay(attempt);
            warn!(attempt, ?delay, error = %last_error, "connection lost, reconnecting");
            tokio::select! {
                () = sleep(delay) => {}
                () = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn drive(&mut self, mut transport: Box<dyn Transport>) -> SessionEnd {
        if let Some(greeting) = &self.greeting {
            if let Err(e) = send_frame(transport.as_mut(), greeting).await {
                return SessionEnd::Lost(e);
            }
        }
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watchdog = sleep(self.config.heartbeat_timeout);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    self.close(transport.as_mut(), NORMAL_CLOSE, "client shutdown").await;
                    return SessionEnd::Stopped;
                }
                event = transport.recv() => {
                    watchdog.as_mut().reset(Instant::now() + self.config.heartbeat_timeout);
                    match event {
                        Some(Ok(TransportEvent::Text(text))) => self.forward(&text),
                        Some(Ok(TransportEvent::Activity)) => {}
                        Some(Ok(TransportEvent::Closed { code: Some(NORMAL_CLOSE), .. })) => {
                            return SessionEnd::Clean;
                        }
                        Some(Ok(TransportEvent::Closed { code, reason })) => {
                            return SessionEnd::Lost(format!("closed with code {code:?}: {reason}"));
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        None => return SessionEnd::Lost("stream ended".into()),
                    }
                }
                _ = heartbeat.tick() => {
                    trace!("sending heartbeat");
                    if let Err(e) = send_frame(transport.as_mut(), &ClientFrame::Ping).await {
                        return SessionEnd::Lost(e);
                    }
                }
                () = &mut watchdog => {
                    warn!(timeout = ?self.config.heartbeat_timeout, "no traffic from server");
                    self.close(transport.as_mut(), HEARTBEAT_TIMEOUT_CODE, HEARTBEAT_TIMEOUT_REASON)
                        .await;
                    return SessionEnd::Lost(HEARTBEAT_TIMEOUT_REASON.into());
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        // Every handle is gone; nobody can use the connection.
                        self.close(transport.as_mut(), NORMAL_CLOSE, "client shutdown").await;
                        return SessionEnd::Stopped;
                    };
                    if let Err(e) = send_frame(transport.as_mut(), &frame).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Hand a decoded frame to the caller. Never waits: a caller that stops
    /// draining loses frames, not the heartbeat.
    fn forward(&self, text: &str) {
        match decode_server_frame(text) {
            Ok(ServerFrame::Pong) => trace!("heartbeat acknowledged"),
            Ok(frame) => match self.inbound.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(capacity = INBOUND_CAPACITY, "inbound queue full; dropping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("inbound receiver dropped; discarding frame");
                }
            },
            Err(e) => warn!(error = %e, "ignoring undecodable server frame"),
        }
    }

    async fn close(&self, transport: &mut dyn Transport, code: u16, reason: &str) {
        self.set_status(ConnectionStatus::Closing);
        if let Err(e) = transport.close(code, reason).await {
            debug!(error = %e, "close failed");
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let _ = self.status.send_replace(status);
    }
}

async fn send_frame(transport: &mut dyn Transport, frame: &ClientFrame) -> Result<(), String> {
    let text = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    transport.send(text).await.map_err(|e| e.to_string())
}
