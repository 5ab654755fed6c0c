//! Transport seam between the supervisor and the socket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::errors::TransportError;

/// Close code for a normal, intentional close.
pub const NORMAL_CLOSE: u16 = 1000;

/// What the transport delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// A control frame (ping/pong). Counts as liveness only.
    Activity,
    /// The peer closed. `code` is absent when no close frame was given.
    Closed { code: Option<u16>, reason: String },
}

/// One open connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next event, or `None` once the stream has ended.
    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects with `tokio-tungstenite`.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

/// [`Transport`] over a tungstenite stream.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        let msg = match self.stream.next().await? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
        };
        let event = match msg {
            Message::Text(text) => TransportEvent::Text(text.as_str().to_string()),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => TransportEvent::Text(text),
                Err(_) => TransportEvent::Activity,
            },
            Message::Close(frame) => TransportEvent::Closed {
                code: frame.as_ref().map(|f| u16::from(f.code)),
                reason: frame
                    .map(|f| f.reason.as_str().to_string())
                    .unwrap_or_default(),
            },
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => TransportEvent::Activity,
        };
        Some(Ok(event))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
