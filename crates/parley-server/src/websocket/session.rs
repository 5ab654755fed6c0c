//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parley_core::ServerFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;

/// Heartbeat timing for a session.
#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    /// Interval between server-initiated Ping frames.
    pub interval: Duration,
    /// Close the session after this long without any inbound frame.
    pub timeout: Duration,
}

/// Run a WebSocket session.
///
/// 1. Registers the connection and sends `connected`
/// 2. Dispatches inbound text frames
/// 3. Forwards queued outbound frames and sends periodic Pings
/// 4. Closes a client silent for longer than the heartbeat timeout
/// 5. Unregisters and stops the turn worker on exit
#[instrument(skip_all, fields(connection_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    dispatcher: Arc<Dispatcher>,
    max_send_queue: usize,
    heartbeat: HeartbeatConfig,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel(max_send_queue.max(1));

    let registry = Arc::clone(dispatcher.registry());
    let connection_id = registry.register(send_tx);
    let _ = tracing::Span::current().record("connection_id", connection_id.as_str());
    let Some(connection) = registry.lookup(&connection_id) else {
        return;
    };
    info!("client connected");

    let _ = connection.send_frame(&ServerFrame::Connected {
        connection_id: connection_id.clone(),
    });

    // Outbound forwarder with periodic Ping frames and the idle check.
    let outbound_conn = Arc::clone(&connection);
    let writer_cancel = shutdown.child_token();
    let writer_stop = writer_cancel.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if outbound_conn.idle_for() > heartbeat.timeout {
                        warn!(timeout = ?heartbeat.timeout, "heartbeat timeout, closing");
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = writer_stop.cancelled() => break,
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let dispatch = dispatcher.attach(Arc::clone(&connection));

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = &mut outbound => break,
            () = shutdown.cancelled() => break,
        };
        let Some(Ok(msg)) = msg else { break };
        connection.mark_seen();
        match msg {
            WsMessage::Text(text) => dispatch.handle_text(text.as_str()),
            WsMessage::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch.handle_text(text),
                Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            WsMessage::Close(_) => {
                info!("client sent close frame");
                break;
            }
            // axum answers Pings itself; Pongs only count as activity.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    let _ = dispatch.close();
    writer_cancel.cancel();
    let _ = registry.unregister(&connection_id);
    info!(dropped_frames = connection.dropped_frames(), "client disconnected");
}
