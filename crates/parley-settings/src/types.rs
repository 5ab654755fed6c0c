//! Settings types. Every struct uses `#[serde(default)]` so partial files
//! deserialize cleanly.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    pub server: ServerSettings,
    pub pipeline: PipelineSettings,
    pub client: ClientSettings,
    pub llm: LlmSettings,
    pub telemetry: TelemetrySettings,
}

impl ParleySettings {
    /// Reject combinations that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutSecs must not be shorter than the interval".into(),
            ));
        }
        if self.client.heartbeat_interval_ms == 0 || self.client.heartbeat_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "client heartbeat durations must be positive".into(),
            ));
        }
        if self.pipeline.planner_window == 0 {
            return Err(SettingsError::InvalidValue(
                "pipeline.plannerWindow must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection. Turn output waits for room;
    /// broadcasts and inline replies are dropped when it is full.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// Close a connection that has sent nothing for this long.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9480,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

/// Turn pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    /// Messages retained per session.
    pub history_limit: usize,
    /// Messages handed to the planner.
    pub planner_window: usize,
    /// How often `processing` is re-sent while the planner is running.
    pub processing_interval_ms: u64,
    /// Planner calls slower than this are treated as failures. `0` disables.
    pub planner_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            history_limit: 20,
            planner_window: 6,
            processing_interval_ms: 5_000,
            planner_timeout_ms: 30_000,
        }
    }
}

/// Client connection supervisor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub url: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9480/ws".to_string(),
            heartbeat_interval_ms: 25_000,
            heartbeat_timeout_ms: 60_000,
            reconnect_base_ms: 1_000,
            reconnect_jitter_ms: 500,
            max_reconnect_attempts: 5,
        }
    }
}

/// Generation backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    pub api_url: String,
    pub planner_model: String,
    pub executor_model: String,
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            planner_model: "claude-3-5-haiku-latest".to_string(),
            executor_model: "claude-3-5-haiku-latest".to_string(),
            max_tokens: 1024,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_value(ParleySettings::default()).unwrap();
        assert!(json["server"]["heartbeatIntervalSecs"].is_number());
        assert!(json["pipeline"]["plannerWindow"].is_number());
        assert!(json["client"]["maxReconnectAttempts"].is_number());
    }

    #[test]
    fn partial_section_fills_defaults() {
        let settings: ParleySettings =
            serde_json::from_str(r#"{"server": {"port": 1234}}"#).unwrap();
        assert_eq!(settings.server.port, 1234);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.pipeline.history_limit, 20);
    }

    #[test]
    fn validate_rejects_timeout_shorter_than_interval() {
        let mut settings = ParleySettings::default();
        settings.server.heartbeat_timeout_secs = 5;
        settings.server.heartbeat_interval_secs = 10;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut settings = ParleySettings::default();
        settings.pipeline.planner_window = 0;
        assert!(settings.validate().is_err());
    }
}
