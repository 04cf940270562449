//! `HubServer` — Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::health::{self, HealthResponse};
use crate::room::group::{Group, GroupHandle};
use crate::room::member::Member;
use crate::shutdown::Shutdown;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the group coordinator.
    pub group: GroupHandle,
    /// Server configuration.
    pub config: Arc<HubConfig>,
    /// When the server started.
    pub start_time: Instant,
}

/// Body of the `/members` listing.
#[derive(Debug, Serialize)]
pub struct MemberListResponse {
    /// Ids of all currently-registered members, sorted.
    #[serde(rename = "MemberIds")]
    pub member_ids: Vec<String>,
}

/// The main roomhub server.
pub struct HubServer {
    config: Arc<HubConfig>,
    group: GroupHandle,
    group_task: JoinHandle<()>,
    shutdown: Shutdown,
    start_time: Instant,
}

impl HubServer {
    /// Create a new server and spawn its group coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: HubConfig) -> Self {
        let shutdown = Shutdown::new();
        let (group, group_task) = Group::spawn(shutdown.child_token());
        Self {
            config: Arc::new(config),
            group,
            group_task,
            shutdown,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            group: self.group.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/", get(home_handler))
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/members", get(members_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve. Returns the bound address and the serve task handle;
    /// the task completes after [`Shutdown::trigger`] once every connection
    /// has drained.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %error, "server error");
            }
        });
        Ok((addr, handle))
    }

    /// Get the group coordinator handle.
    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Wait for the group coordinator to finish its shutdown drain.
    ///
    /// Call once, after [`Shutdown::trigger`].
    pub async fn join_group(&mut self) {
        if let Err(error) = (&mut self.group_task).await {
            if !error.is_cancelled() {
                error!(error = %error, "group coordinator task failed");
            }
        }
    }
}

/// GET /
async fn home_handler() -> &'static str {
    "This is the roomhub server."
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let members = state.group.member_count().await.unwrap_or(0);
    Json(health::health_check(state.start_time, members))
}

/// GET /members — static-secret-gated snapshot of member ids.
async fn members_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|secret| secret == state.config.secret);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    match state.group.member_ids().await {
        Ok(member_ids) => Json(MemberListResponse { member_ids }).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// GET /ws — promote the connection to a room member.
///
/// The upgrade callback blocks for the lifetime of the connection: it
/// returns only once the member is fully torn down.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let id = Uuid::new_v4().to_string();
        let member = Member::new(id, state.group.clone(), &state.config);
        member.run(socket).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> HubServer {
        HubServer::new(HubConfig {
            secret: "test-secret".into(),
            ..HubConfig::default()
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn server_with_default_config() {
        let server = HubServer::new(HubConfig::default());
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
    }

    #[tokio::test]
    async fn group_handle_accessible() {
        let server = make_server();
        assert_eq!(server.group().member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_coordinator_accessible() {
        let server = make_server();
        assert!(!server.shutdown().is_shutting_down());
        server.shutdown().trigger();
        assert!(server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn home_returns_ok() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
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

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["members"], 0);
        assert!(parsed["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn members_without_secret_is_unauthorized() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/members")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        assert_eq!(&body[..], b"Unauthorized");
    }

    #[tokio::test]
    async fn members_with_wrong_secret_is_unauthorized() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/members")
            .header("authorization", "nope")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn members_with_secret_lists_ids() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/members")
            .header("authorization", "test-secret")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert!(parsed["MemberIds"].is_array());
        assert_eq!(parsed["MemberIds"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn ws_route_rejects_plain_get() {
        let server = make_server();
        let app = server.router();

        // No upgrade headers: the extractor rejects the request
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
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
    async fn member_list_response_field_name() {
        let resp = MemberListResponse {
            member_ids: vec!["a".into(), "b".into()],
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["MemberIds"], serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn listen_binds_auto_port() {
        let server = make_server();
        let (addr, _handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().trigger();
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_serve_task() {
        let mut server = make_server();
        let (_addr, handle) = server.listen().await.unwrap();

        server.shutdown().trigger();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("shutdown timed out")
            .expect("join error");
        server.join_group().await;
    }
}
