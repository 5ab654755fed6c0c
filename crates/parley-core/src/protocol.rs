//! Wire frames exchanged over the WebSocket.
//!
//! One JSON object per text frame, discriminated by `type`, with camelCase
//! field names. [`ClientFrame`] travels client to server, [`ServerFrame`]
//! server to client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::ConnectionId;
use crate::plan::InteractionKind;

/// Frame types a client may send.
pub const CLIENT_FRAME_TYPES: [&str; 5] =
    ["initialize", "user_input", "ping", "update_templates", "stats"];

/// Client-to-server frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Initialize {
        subject_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<Map<String, Value>>,
    },
    #[serde(rename_all = "camelCase")]
    UserInput { subject_id: String, text: String },
    Ping,
    UpdateTemplates {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        planner: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executor: Option<String>,
    },
    Stats,
}

/// Server-to-client frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    Initialized {
        subject_id: String,
        profile: Map<String, Value>,
    },
    Processing { message: String },
    #[serde(rename_all = "camelCase")]
    StreamChunk { content: String, is_final: bool },
    #[serde(rename_all = "camelCase")]
    FinalResponse {
        content: String,
        is_final: bool,
        interaction_type: InteractionKind,
    },
    Pong,
    Error { message: String },
    TemplatesUpdated { revision: u64 },
    #[serde(rename_all = "camelCase")]
    Stats {
        connection_count: usize,
        session_count: usize,
    },
}

impl ServerFrame {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::StreamChunk {
            content: content.into(),
            is_final: false,
        }
    }

    pub fn final_response(content: impl Into<String>, interaction_type: InteractionKind) -> Self {
        Self::FinalResponse {
            content: content.into(),
            is_final: true,
            interaction_type,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// The `type` discriminator as sent on the wire.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Initialized { .. } => "initialized",
            Self::Processing { .. } => "processing",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::FinalResponse { .. } => "final_response",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
            Self::TemplatesUpdated { .. } => "templates_updated",
            Self::Stats { .. } => "stats",
        }
    }

    /// Whether this frame ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalResponse { .. } | Self::Error { .. })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A frame the peer should be told about.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid {frame_type} frame: {reason}")]
    InvalidFrame { frame_type: String, reason: String },
    #[error("session not initialized; send initialize first")]
    NotInitialized,
    #[error("subjectId {got} does not match the initialized subject {expected}")]
    SubjectMismatch { expected: String, got: String },
    #[error("update_templates needs a planner or executor template")]
    EmptyTemplateUpdate,
    #[error("connection is closed")]
    Closed,
}

/// Why an inbound frame could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not a JSON object with a string `type`. Dropped without a reply.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed but unusable. Answered with an `error` frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Decode one text frame.
///
/// The frame is read as a JSON value first so a missing or unknown `type`
/// can be told apart from a known type with bad fields.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(DecodeError::Malformed("frame is not a JSON object".into()));
    };
    let Some(frame_type) = object.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::Malformed("frame has no string type".into()));
    };
    if !CLIENT_FRAME_TYPES.contains(&frame_type) {
        return Err(ProtocolError::UnknownType(frame_type.to_string()).into());
    }
    let frame_type = frame_type.to_string();
    serde_json::from_value(value).map_err(|e| {
        ProtocolError::InvalidFrame {
            frame_type,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Decode a server frame on the client side.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_str(text)
}
