//! `StudioServer` — Axum HTTP server wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use studio_runtime::ChatOrchestrator;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, instrument, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::socket::{run_socket_session, SocketBroadcaster, SocketNamespace};
use crate::storage::ChatStorage;

/// Generates UUIDv7 request ids.
#[derive(Clone)]
struct UuidV7RequestId;

impl MakeRequestId for UuidV7RequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        axum::http::HeaderValue::from_str(&id)
            .ok()
            .map(RequestId::new)
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The orchestration facade.
    pub orchestrator: Arc<ChatOrchestrator>,
    /// Socket bus.
    pub broadcaster: Arc<SocketBroadcaster>,
    /// Uploaded chat file storage.
    pub storage: Arc<ChatStorage>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Server configuration.
    pub config: ServerConfig,
    /// Prometheus metrics handle for rendering.
    pub metrics_handle: Arc<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The studio HTTP server.
pub struct StudioServer {
    state: AppState,
}

impl StudioServer {
    /// Wire the server from its collaborators.
    pub fn new(
        config: ServerConfig,
        orchestrator: Arc<ChatOrchestrator>,
        broadcaster: Arc<SocketBroadcaster>,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let storage = Arc::new(ChatStorage::new(config.upload_dir.clone()));
        Self {
            state: AppState {
                orchestrator,
                broadcaster,
                storage,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                config,
                metrics_handle: Arc::new(metrics_handle),
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/chat/send", post(routes::chat::send))
            .route("/api/chat/stream", post(routes::chat::stream))
            .route("/api/chat/interrupt", post(routes::chat::interrupt))
            .route("/api/chat/upload", post(routes::chat::upload))
            .route("/api/conversations", get(routes::conversations::list))
            .route(
                "/api/conversations/{id}/messages",
                get(routes::conversations::messages),
            )
            .route(
                "/api/conversations/{id}",
                delete(routes::conversations::remove),
            )
            .route(
                "/trpc/pushMessageToChatAgent",
                post(routes::hooks::push_message),
            )
            .route(
                "/trpc/pushFinishedSignalToChatAgent",
                post(routes::hooks::push_finished),
            )
            .route("/ws/client", get(ws_client_handler))
            .route("/ws/agent", get(ws_agent_handler))
            .with_state(self.state.clone())
            // Outermost layers execute first on request, last on response.
            .layer(CatchPanicLayer::new())
            .layer(RequestBodyLimitLayer::new(self.state.config.max_body_bytes))
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
            .layer(SetRequestIdLayer::x_request_id(UuidV7RequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
    }

    /// Bind to a TCP port and start serving. Returns the bound address and a
    /// join handle for the server task.
    #[instrument(skip_all, fields(host = %self.state.config.host, port = self.state.config.port))]
    pub async fn listen(
        &self,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "server started");

        let router = self.router();
        let shutdown_token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                    info!("server shutdown initiated");
                })
                .await;
            info!("server shutdown complete");
        });

        Ok((bound_addr, handle))
    }

    /// Get the shared state (for tests and the binary).
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.broadcaster.connection_count().await;
    let active = state.orchestrator.running_agent_count();
    Json(health::health_check(state.start_time, connections, active))
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// GET /ws/client — frontend socket upgrade.
async fn ws_client_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let current = state.broadcaster.connection_count().await;
    if current >= state.config.max_connections {
        warn!(
            current,
            max = state.config.max_connections,
            "connection limit reached, rejecting socket upgrade"
        );
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let client_id = uuid::Uuid::now_v7().to_string();
    let broadcaster = state.broadcaster;
    Ok(ws.on_upgrade(move |socket| {
        run_socket_session(socket, SocketNamespace::Client, client_id, broadcaster)
    }))
}

/// GET /ws/agent — reserved agent socket upgrade.
async fn ws_agent_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let client_id = uuid::Uuid::now_v7().to_string();
    let broadcaster = state.broadcaster;
    ws.on_upgrade(move |socket| {
        run_socket_session(socket, SocketNamespace::Agent, client_id, broadcaster)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use studio_runtime::{AgentSettings, NullBroadcastSink};
    use studio_store::{new_in_memory, run_migrations, ConnectionConfig, StudioStore};
    use tower::ServiceExt;

    fn make_store() -> StudioStore {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            run_migrations(&conn).unwrap();
        }
        StudioStore::new(pool)
    }

    fn make_metrics_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn make_server() -> StudioServer {
        let broadcaster = Arc::new(SocketBroadcaster::new());
        // Plain sink: these tests never exercise the socket push path
        let orchestrator = ChatOrchestrator::new(
            make_store(),
            AgentSettings::default(),
            "http://127.0.0.1:0".into(),
            Arc::new(NullBroadcastSink),
        );
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            upload_dir: dir.path().to_str().unwrap().to_string(),
            ..ServerConfig::default()
        };
        StudioServer::new(config, orchestrator, broadcaster, make_metrics_handle())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert!(parsed["uptime_secs"].is_number());
        assert!(parsed["connections"].is_number());
        assert!(parsed["active_replies"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_send_without_identity_is_401() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .method("POST")
            .uri("/api/chat/send")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"message": "hi"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_endpoint_requires_upgrade() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/ws/client")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn server_listen_binds_and_shuts_down() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown timed out")
            .expect("join error");
    }

    #[tokio::test]
    async fn conversations_list_requires_identity() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/api/conversations")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn callback_secret_enforced_when_configured() {
        let broadcaster = Arc::new(SocketBroadcaster::new());
        let orchestrator = ChatOrchestrator::new(
            make_store(),
            AgentSettings::default(),
            "http://127.0.0.1:0".into(),
            Arc::new(NullBroadcastSink),
        );
        let config = ServerConfig {
            callback_secret: Some("s3cret".into()),
            ..ServerConfig::default()
        };
        let server = StudioServer::new(config, orchestrator, broadcaster, make_metrics_handle());
        let app = server.router();

        // Missing secret → 401
        let req = Request::builder()
            .method("POST")
            .uri("/trpc/pushFinishedSignalToChatAgent")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"replyId": "r1"}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Correct secret → accepted (unknown reply still reads as success)
        let req = Request::builder()
            .method("POST")
            .uri("/trpc/pushFinishedSignalToChatAgent")
            .header("content-type", "application/json")
            .header("x-studio-secret", "s3cret")
            .body(Body::from(r#"{"replyId": "r1"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
    }

    #[tokio::test]
    async fn orphan_callback_returns_success() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .method("POST")
            .uri("/trpc/pushMessageToChatAgent")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"replyId": "ghost", "events": [{"type": "text", "content": "x"}]}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
    }
}
