//! Client side of the coordinator API.
//!
//! [`CoordinatorApi`] is what the transport session manager needs from the
//! coordinator. It is implemented over HTTP by [`HttpCoordinatorClient`] and
//! in-process by [`CoordinatorHandle`].

mod sse;

pub use sse::{SseEvent, SseLineParser};

use crate::config::TransportConfig;
use crate::coordinator::{CoordinatorHandle, SessionInfo};
use crate::error::{Result, VoxError};
use crate::events::{ClientRequest, ContextPayload, PushEvent};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Stream of push events; ends when the channel closes.
pub type PushStream = Pin<Box<dyn Stream<Item = PushEvent> + Send>>;

#[async_trait]
pub trait CoordinatorApi: Send + Sync + 'static {
    /// Ask for a live session and its credential.
    async fn connection_ready(&self) -> Result<SessionInfo>;
    /// Tear the session down; returns the fresh session id.
    async fn reset_session(&self) -> Result<String>;
    /// Open the push channel.
    async fn subscribe(&self) -> Result<PushStream>;
}

#[async_trait]
impl CoordinatorApi for CoordinatorHandle {
    async fn connection_ready(&self) -> Result<SessionInfo> {
        CoordinatorHandle::connection_ready(self).await
    }

    async fn reset_session(&self) -> Result<String> {
        self.reset().await
    }

    async fn subscribe(&self) -> Result<PushStream> {
        let mut subscription = CoordinatorHandle::subscribe(self).await?;
        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = subscription.recv().await {
                yield event;
            }
        }))
    }
}

/// Coordinator client over HTTP + SSE.
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    base_url: String,
    client: reqwest::Client,
    /// No overall timeout: the push channel is long-lived.
    stream_client: reqwest::Client,
}

impl HttpCoordinatorClient {
    #[must_use]
    pub fn new(config: &TransportConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            base_url: config.coordinator_url.trim_end_matches('/').to_owned(),
            client,
            stream_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("coordinator request failed: {e}")))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(map_status(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| VoxError::Transport(format!("malformed coordinator response: {e}")))
    }

    /// Post any client request.
    pub async fn send(&self, request: &ClientRequest) -> Result<Value> {
        let body = serde_json::to_value(request)
            .map_err(|e| VoxError::InvalidRequest(format!("encode request: {e}")))?;
        self.post("/api/message", &body).await
    }

    pub async fn submit_context(&self, payload: &ContextPayload) -> Result<Value> {
        let mut body = serde_json::to_value(payload)
            .map_err(|e| VoxError::InvalidRequest(format!("encode context: {e}")))?;
        // The ingestion endpoint names the kind `type`.
        if let Some(obj) = body.as_object_mut()
            && let Some(kind) = obj.remove("contextType")
        {
            obj.insert("type".to_owned(), kind);
        }
        self.post("/api/context", &body).await
    }
}

fn map_status(status: reqwest::StatusCode, body: &str) -> VoxError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| body.to_owned());
    match status.as_u16() {
        400 => VoxError::InvalidRequest(message),
        503 => VoxError::NotConnected(message),
        500 => VoxError::Credential(message),
        code => VoxError::Transport(format!("coordinator HTTP {code}: {message}")),
    }
}

fn decode_push(event: &SseEvent) -> Option<PushEvent> {
    match serde_json::from_str(&event.data) {
        Ok(push) => Some(push),
        Err(e) => {
            debug!(event = ?event.event, "ignoring undecodable push event: {e}");
            None
        }
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinatorClient {
    async fn connection_ready(&self) -> Result<SessionInfo> {
        let value = self.send(&ClientRequest::ConnectionReady).await?;
        serde_json::from_value(value)
            .map_err(|e| VoxError::Transport(format!("malformed session response: {e}")))
    }

    async fn reset_session(&self) -> Result<String> {
        let value = self.post("/api/reset", &Value::Null).await?;
        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| VoxError::Transport("reset response without sessionId".to_owned()))
    }

    async fn subscribe(&self) -> Result<PushStream> {
        let response = self
            .stream_client
            .get(self.url("/api/events"))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("push channel connect failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status(status, &text));
        }

        let mut bytes = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut parser = SseLineParser::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for event in parser.push(&chunk) {
                            if let Some(push) = decode_push(&event) {
                                yield push;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("push channel read error: {e}");
                        break;
                    }
                }
            }
            if let Some(push) = parser.flush().as_ref().and_then(decode_push) {
                yield push;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            map_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, r#"{"error":"later"}"#),
            VoxError::NotConnected(m) if m == "later"
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::BAD_REQUEST, "nope"),
            VoxError::InvalidRequest(_)
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::BAD_GATEWAY, ""),
            VoxError::Transport(_)
        ));
    }

    #[test]
    fn push_decoding_skips_garbage() {
        let ok = SseEvent {
            data: r#"{"type":"agent_start"}"#.into(),
            ..SseEvent::default()
        };
        assert_eq!(decode_push(&ok), Some(PushEvent::AgentStart));
        let bad = SseEvent {
            data: "hello".into(),
            ..SseEvent::default()
        };
        assert_eq!(decode_push(&bad), None);
    }
}
