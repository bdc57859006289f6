//! HTTP surface of the session coordinator.
//!
//! ## Endpoints
//!
//! - `GET /api/events`: SSE push channel, one subscriber per stream
//! - `POST /api/message`: client requests
//! - `POST /api/context`: out-of-band context ingestion
//! - `POST /api/reset`: tear down the session
//! - `GET /api/stats`: session counters
//! - `GET /api/ping`: liveness

use crate::config::ServerConfig;
use crate::coordinator::{ContextOutcome, CoordinatorHandle, MessageOutcome};
use crate::error::{Result, VoxError};
use crate::events::{ClientRequest, ContextPayload};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use axum::routing::{get, post};
use chrono::Utc;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

impl IntoResponse for VoxError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            Self::InvalidRequest(detail) => detail.clone(),
            other => {
                warn!(error = %other, "request failed");
                other.user_message().to_owned()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn rejection(err: &JsonRejection) -> VoxError {
    VoxError::InvalidRequest(format!("malformed payload: {}", err.body_text()))
}

#[derive(Clone)]
struct AppState {
    coordinator: CoordinatorHandle,
    keep_alive: Duration,
}

/// Context ingestion body. The sender's kind arrives as `type`.
#[derive(Debug, Deserialize)]
struct ContextBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default, rename = "type", alias = "contextType")]
    kind: Option<String>,
}

impl From<ContextBody> for ContextPayload {
    fn from(body: ContextBody) -> Self {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            text: non_blank(body.text),
            image: non_blank(body.image),
            prompt: non_blank(body.prompt),
            context_type: body.kind,
        }
    }
}

/// Build the router around a running coordinator.
pub fn router(coordinator: CoordinatorHandle, config: &ServerConfig) -> Router {
    let state = AppState {
        coordinator,
        keep_alive: Duration::from_secs(config.keep_alive_secs.max(1)),
    };
    Router::new()
        .route("/api/events", get(handle_events))
        .route("/api/message", post(handle_message))
        .route("/api/context", post(handle_context))
        .route("/api/reset", post(handle_reset))
        .route("/api/stats", get(handle_stats))
        .route("/api/ping", get(handle_ping))
        .with_state(state)
}

/// Coordinator HTTP server running in a background task.
pub struct VoxServer {
    addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl VoxServer {
    /// Bind `{config.host}:{config.port}` (port `0` auto-assigns) and serve.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot bind.
    pub async fn start(coordinator: CoordinatorHandle, config: &ServerConfig) -> Result<Self> {
        let app = router(coordinator, config);
        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| VoxError::Config(format!("bind {bind_addr} failed: {e}")))?;
        let addr = listener.local_addr()?;

        info!("coordinator listening on http://{addr}/api");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("coordinator server error: {e}");
            }
        });
        Ok(Self {
            addr,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Abort the server task.
    pub fn shutdown(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Wait for the server task to finish.
    pub async fn join(mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "coordinator server task failed");
        }
    }
}

impl Drop for VoxServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// `GET /api/events`: `connected` first, then every coordinator push.
async fn handle_events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut subscription = state.coordinator.subscribe().await?;
    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            match Event::default().event(event.kind()).json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(kind = event.kind(), "push event not encodable: {e}"),
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

/// `POST /api/message`
async fn handle_message(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ClientRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(|e| rejection(&e))?;
    match state.coordinator.message(request).await? {
        MessageOutcome::Session(info) => Ok(Json(info).into_response()),
        MessageOutcome::Accepted => Ok(Json(json!({ "ok": true })).into_response()),
    }
}

/// `POST /api/context`
async fn handle_context(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ContextBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let Json(body) = payload.map_err(|e| rejection(&e))?;
    let outcome = state.coordinator.submit_context(body.into()).await?;
    Ok(Json(match outcome {
        ContextOutcome::Injected => json!({ "ok": true }),
        ContextOutcome::Stored { storage_key } => json!({
            "success": true,
            "stored": true,
            "storageKey": storage_key,
        }),
    }))
}

/// `POST /api/reset`
async fn handle_reset(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let session_id = state.coordinator.reset().await?;
    Ok(Json(json!({ "sessionId": session_id })))
}

/// `GET /api/stats`
async fn handle_stats(State(state): State<AppState>) -> Result<Response> {
    let stats = state.coordinator.stats().await?;
    Ok(Json(stats).into_response())
}

/// `GET /api/ping`
async fn handle_ping() -> Json<serde_json::Value> {
    Json(json!({ "pong": true, "timestamp": Utc::now().to_rfc3339() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoxConfig;
    use crate::coordinator::Coordinator;
    use crate::speech::SpeechService;
    use crate::testing::FakeSpeechService;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Arc<FakeSpeechService>, Router) {
        let service = FakeSpeechService::new();
        let coordinator = Coordinator::spawn(
            &VoxConfig::default(),
            Arc::clone(&service) as Arc<dyn SpeechService>,
        )
        .unwrap();
        (service, router(coordinator, &ServerConfig::default()))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ping_answers() {
        let (_, app) = app();
        let response = app
            .oneshot(Request::get("/api/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["pong"], true);
    }

    #[tokio::test]
    async fn connection_ready_returns_credential() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json("/api/message", r#"{"type":"connection_ready"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["credential"]["value"], "ek_test_1");
        assert!(body["sessionId"].is_string());
    }

    #[tokio::test]
    async fn malformed_message_is_bad_request() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json("/api/message", r#"{"type":"dance"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn text_before_session_is_unavailable() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json("/api/message", r#"{"type":"text","text":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn credential_failure_is_internal_error() {
        let (service, app) = app();
        service.fail_sessions(true);
        let response = app
            .oneshot(post_json("/api/message", r#"{"type":"connection_ready"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(!body["error"].as_str().unwrap().contains("HTTP 401"));
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let (_, app) = app();
        let response = app
            .oneshot(Request::get("/api/message").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn context_is_stored_without_session() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json(
                "/api/context",
                r#"{"text":"Day 1: Louvre","type":"itinerary"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["stored"], true);
        assert!(body["storageKey"].is_string());
    }

    #[tokio::test]
    async fn empty_context_is_bad_request() {
        let (_, app) = app();
        let response = app
            .oneshot(post_json("/api/context", r#"{"text":"   "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reset_and_stats() {
        let (_, app) = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/reset", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = json_body(response).await["sessionId"]
            .as_str()
            .unwrap()
            .to_owned();

        let response = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats = json_body(response).await;
        assert_eq!(stats["sessionId"], session_id);
        assert_eq!(stats["phase"], "uninitialized");
    }

    #[tokio::test]
    async fn event_stream_starts_with_connected() {
        let (_, app) = app();
        let response = app
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&first);
        assert!(text.contains("event: connected"));
        assert!(text.contains(r#"{"type":"connected"}"#));
    }
}
