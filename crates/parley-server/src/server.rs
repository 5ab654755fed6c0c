//! `ParleyServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use parley_core::{Executor, Planner, ServerFrame, SessionStore, TemplateStore};
use parley_engine::TurnPipeline;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{run_ws_session, HeartbeatConfig};

/// Message of the `error` frame broadcast before a graceful shutdown.
pub const SHUTDOWN_NOTICE: &str = "server shutting down";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    pub max_send_queue: usize,
    pub heartbeat: HeartbeatConfig,
}

/// The turn server.
pub struct ParleyServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl ParleyServer {
    pub fn new(
        config: ServerConfig,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        store: Arc<dyn SessionStore>,
        templates: Arc<TemplateStore>,
    ) -> Self {
        let pipeline = TurnPipeline::new(planner, executor, store, templates, config.pipeline.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(pipeline),
        ));
        Self {
            config,
            dispatcher,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            max_send_queue: self.config.max_send_queue,
            heartbeat: HeartbeatConfig {
                interval: self.config.heartbeat_interval,
                timeout: self.config.heartbeat_timeout,
            },
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve in the background. Returns the bound address and the
    /// serve task, which ends once shutdown is requested.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => return Err(ServerError::Bind { addr, source }),
        };
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%local_addr, "parley server listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Tell every connected client the server is going away. Returns how
    /// many connections accepted the notice.
    pub fn notify_shutdown(&self) -> usize {
        let notified = self
            .registry()
            .broadcast(&ServerFrame::error(SHUTDOWN_NOTICE));
        info!(notified, "shutdown notice sent");
        notified
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.dispatcher.registry()
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.dispatcher.registry().count();
    Json(health::health_check(state.start_time, connections))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        run_ws_session(
            socket,
            state.dispatcher,
            state.max_send_queue,
            state.heartbeat,
            state.shutdown.token(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parley_core::store::InMemorySessionStore;
    use parley_engine::mock::{ScriptedExecutor, ScriptedPlanner};
    use tower::ServiceExt;

    fn make_server() -> ParleyServer {
        ParleyServer::new(
            ServerConfig::default(),
            Arc::new(ScriptedPlanner::failing()),
            Arc::new(ScriptedExecutor::echo()),
            Arc::new(InMemorySessionStore::new(10)),
            Arc::new(TemplateStore::default()),
        )
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert!(parsed["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_notice_reaches_registered_connections() {
        let server = make_server();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let _ = server.registry().register(tx);

        assert_eq!(server.notify_shutdown(), 1);
        let text = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["message"], SHUTDOWN_NOTICE);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
