//! Per-connection handle and protocol state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::ids::ConnectionId;
use parley_core::{ProtocolError, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

/// Serialized frame queued for the writer task.
pub type OutboundText = Arc<String>;

/// An open WebSocket connection as seen by the registry.
pub struct Connection {
    pub id: ConnectionId,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<OutboundText>,
    last_seen: Mutex<Instant>,
    dropped_frames: AtomicU64,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundText>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            tx,
            last_seen: Mutex::new(Instant::now()),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Queue serialized text for the writer.
    ///
    /// Returns `false` if the queue is full or the writer is gone; the
    /// dropped-frame counter is bumped either way.
    pub fn send(&self, text: OutboundText) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue serialized text, waiting for room in the writer's queue.
    ///
    /// Returns `false` only once the writer is gone.
    pub async fn deliver(&self, text: OutboundText) -> bool {
        if self.tx.send(text).await.is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue a frame.
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "failed to serialize frame");
                false
            }
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn mark_seen(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Protocol state of one connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, no session bound.
    #[default]
    Connected,
    /// `initialize` received, context being built.
    Initializing { subject_id: String },
    /// Session bound, accepting turns.
    Ready { subject_id: String },
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Initializing { .. } => "initializing",
            Self::Ready { .. } => "ready",
            Self::Closed => "closed",
        }
    }

    /// Enter `Initializing`. Returns the state to restore if building the
    /// context fails.
    pub fn begin_initialize(&mut self, subject_id: &str) -> Result<ConnectionState, ProtocolError> {
        if *self == Self::Closed {
            return Err(ProtocolError::Closed);
        }
        let previous = std::mem::replace(
            self,
            Self::Initializing {
                subject_id: subject_id.to_string(),
            },
        );
        Ok(previous)
    }

    /// `Initializing -> Ready`. A no-op in any other state.
    pub fn finish_initialize(&mut self) {
        if let Self::Initializing { subject_id } = self {
            *self = Self::Ready {
                subject_id: std::mem::take(subject_id),
            };
        }
    }

    /// Put back the state saved by [`Self::begin_initialize`].
    pub fn abort_initialize(&mut self, previous: ConnectionState) {
        if matches!(self, Self::Initializing { .. }) {
            *self = previous;
        }
    }

    /// The bound subject, checked against the one a `user_input` names.
    pub fn check_turn(&self, subject_id: &str) -> Result<(), ProtocolError> {
        match self {
            Self::Ready { subject_id: bound } if bound == subject_id => Ok(()),
            Self::Ready { subject_id: bound } => Err(ProtocolError::SubjectMismatch {
                expected: bound.clone(),
                got: subject_id.to_string(),
            }),
            Self::Closed => Err(ProtocolError::Closed),
            Self::Connected | Self::Initializing { .. } => Err(ProtocolError::NotInitialized),
        }
    }

    pub fn close(&mut self) {
        *self = Self::Closed;
    }

    pub fn is_closed(&self) -> bool {
        *self == Self::Closed
    }
}
