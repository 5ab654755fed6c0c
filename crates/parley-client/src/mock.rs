//! In-memory [`Connector`] for driving the supervisor in tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::TransportError;
use crate::transport::{Connector, Transport, TransportEvent};

/// What the client wrote to a [`MockTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Close { code: u16, reason: String },
}

/// Server side of an accepted mock connection.
pub struct MockPeer {
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
    pub from_client: mpsc::UnboundedReceiver<Sent>,
}

impl MockPeer {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(TransportEvent::Text(text.into()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    /// Next thing the client sent, or `None` once the transport is gone.
    pub async fn next_sent(&mut self) -> Option<Sent> {
        self.from_client.recv().await
    }
}

pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Sent::Text(text))
            .map_err(|_| TransportError::Send("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let _ = self.outbound.send(Sent::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// Scripted connect outcome. Once the script runs out every connect fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
}

/// Connector that follows a script and records when each attempt happened.
pub struct MockConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    /// Returns the connector and a stream of peers for accepted connections.
    pub fn new(script: Vec<ConnectOutcome>) -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Mutex::new(script.into()),
                attempts: Arc::new(Mutex::new(Vec::new())),
                peers,
            },
            peers_rx,
        )
    }

    pub fn attempts(&self) -> Arc<Mutex<Vec<Instant>>> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.lock().push(Instant::now());
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ConnectOutcome::Refuse);
        match outcome {
            ConnectOutcome::Refuse => Err(TransportError::Connect("connection refused".into())),
            ConnectOutcome::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = self.peers.send(MockPeer {
                    to_client,
                    from_client,
                });
                Ok(Box::new(MockTransport { inbound, outbound }))
            }
        }
    }
}
