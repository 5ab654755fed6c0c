//! Server configuration.

use std::time::Duration;

use parley_engine::PipelineConfig;
use parley_settings::ParleySettings;

/// Runtime configuration for [`crate::server::ParleyServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind. `0` lets the OS pick.
    pub port: u16,
    /// Outbound frames buffered per connection.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Close connections silent for longer than this.
    pub heartbeat_timeout: Duration,
    /// Messages retained per session.
    pub history_limit: usize,
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            history_limit: 20,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ParleySettings) -> Self {
        let server = &settings.server;
        let pipeline = &settings.pipeline;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_send_queue: server.max_send_queue.max(1),
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
            history_limit: pipeline.history_limit,
            pipeline: PipelineConfig {
                planner_window: pipeline.planner_window,
                processing_interval: Duration::from_millis(pipeline.processing_interval_ms),
                planner_timeout: (pipeline.planner_timeout_ms > 0)
                    .then(|| Duration::from_millis(pipeline.planner_timeout_ms)),
            },
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
