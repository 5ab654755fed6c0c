use serde::Deserialize;
use serde_json::Value;

use parley_core::GenerationError;

/// What one SSE event means for a text-only completion.
#[derive(Clone, Debug, PartialEq)]
pub enum SseEvent {
    TextDelta(String),
    Stop,
    Error(String),
}

/// Parse raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event: ") {
            current_event = event.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            current_data = data.to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    // Trailing event without blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: Value,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// Interpret one Messages API event. Events that carry no text
/// (`message_start`, `ping`, block boundaries) map to `None`.
pub fn interpret_event(event_type: &str, data: &str) -> Option<SseEvent> {
    match event_type {
        "content_block_delta" => {
            let delta: ContentBlockDelta = serde_json::from_str(data).ok()?;
            if delta.delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            let text = delta.delta.get("text").and_then(Value::as_str)?;
            Some(SseEvent::TextDelta(text.to_string()))
        }
        "message_stop" => Some(SseEvent::Stop),
        "error" => Some(SseEvent::Error(data.to_string())),
        _ => None,
    }
}

/// Classify an in-stream `error` event payload.
pub fn classify_error(data: &str) -> GenerationError {
    let Ok(event) = serde_json::from_str::<ErrorEvent>(data) else {
        return GenerationError::StreamInterrupted(data.to_string());
    };
    match event.error.error_type.as_str() {
        "overloaded_error" => GenerationError::ServerError {
            status: 529,
            body: event.error.message,
        },
        "rate_limit_error" => GenerationError::RateLimited { retry_after: None },
        "authentication_error" => GenerationError::AuthenticationFailed(event.error.message),
        "invalid_request_error" => GenerationError::InvalidRequest(event.error.message),
        _ => GenerationError::ServerError {
            status: 500,
            body: event.error.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_events() {
        let raw = "event: message_start\ndata: {}\n\nevent: content_block_delta\ndata: {\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].0, "content_block_delta");
    }

    #[test]
    fn trailing_event_without_blank_line() {
        let events = parse_sse_lines("event: message_stop\ndata: {}");
        assert_eq!(events, vec![("message_stop".to_string(), "{}".to_string())]);
    }

    #[test]
    fn text_delta_is_extracted() {
        let event = interpret_event(
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        );
        assert_eq!(event, Some(SseEvent::TextDelta("Hello".into())));
    }

    #[test]
    fn non_text_events_are_skipped() {
        assert_eq!(interpret_event("ping", "{}"), None);
        assert_eq!(
            interpret_event(
                "content_block_delta",
                r#"{"delta":{"type":"input_json_delta","partial_json":"{"}}"#
            ),
            None
        );
    }

    #[test]
    fn error_classification() {
        let err = classify_error(r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#);
        assert!(matches!(err, GenerationError::RateLimited { .. }));
        let err = classify_error(r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#);
        assert!(err.is_retryable());
        let err = classify_error("garbage");
        assert!(matches!(err, GenerationError::StreamInterrupted(_)));
    }
}
