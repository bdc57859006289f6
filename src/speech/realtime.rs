//! OpenAI-compatible realtime speech service.
//!
//! Credentials come from `POST {base_url}/v1/realtime/sessions`; the
//! server-side link is a websocket to `{realtime_url}?model=...`.

use super::{LinkPeer, RemoteSession, SessionParams, SpeechLink, SpeechService, outbound};
use crate::config::SpeechServiceConfig;
use crate::error::{Result, VoxError, describe_http_status};
use crate::events::Credential;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

const LINK_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    #[serde(default)]
    model: Option<String>,
    client_secret: ClientSecret,
}

/// Realtime speech service over HTTPS + websocket.
pub struct RealtimeSpeechService {
    config: SpeechServiceConfig,
    api_key: String,
    client: reqwest::Client,
}

impl RealtimeSpeechService {
    /// Build a service reading the API key from the configured environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`VoxError::Config`] if the key is not set.
    pub fn new(config: SpeechServiceConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        Ok(Self::with_api_key(config, api_key))
    }

    #[must_use]
    pub fn with_api_key(config: SpeechServiceConfig, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            api_key: api_key.into(),
            client,
        }
    }

    fn sessions_url(&self) -> String {
        format!(
            "{}/v1/realtime/sessions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn realtime_url(&self, model: &str) -> Result<url::Url> {
        url::Url::parse_with_params(&self.config.realtime_url, &[("model", model)])
            .map_err(|e| VoxError::Config(format!("invalid realtime_url: {e}")))
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> VoxError {
        let message = extract_error_message(body);
        VoxError::Credential(format!(
            "{} (HTTP {}): {message}",
            describe_http_status(status.as_u16()),
            status.as_u16()
        ))
    }
}

/// Extract an error message from an OpenAI-style error body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl SpeechService for RealtimeSpeechService {
    async fn create_session(&self, params: &SessionParams) -> Result<RemoteSession> {
        let mut body = params.session_fields();
        body["model"] = serde_json::Value::String(params.model.clone());

        let response = self
            .client
            .post(self.sessions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| VoxError::Transport(format!("credential request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &text));
        }

        let parsed: SessionResponse = response
            .json()
            .await
            .map_err(|e| VoxError::Credential(format!("malformed session response: {e}")))?;
        if parsed.client_secret.value.is_empty() {
            return Err(VoxError::Credential("empty client secret".to_owned()));
        }

        info!(remote_session = %parsed.id, "speech session created");
        Ok(RemoteSession {
            id: parsed.id,
            model: parsed.model.unwrap_or_else(|| params.model.clone()),
            credential: Credential {
                value: parsed.client_secret.value,
                expires_at: parsed.client_secret.expires_at,
            },
        })
    }

    async fn connect(
        &self,
        session: &RemoteSession,
        params: &SessionParams,
    ) -> Result<SpeechLink> {
        let url = self.realtime_url(&session.model)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoxError::Transport(format!("realtime request: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| VoxError::Config(format!("API key is not a valid header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoxError::Transport(format!("realtime connect: {e}")))?;
        info!(remote_session = %session.id, "realtime link open");

        let (link, peer) = SpeechLink::pair(LINK_CAPACITY);
        let update = outbound::session_update(params.session_fields());
        tokio::spawn(bridge(ws, peer, update, session.id.clone()));
        Ok(link)
    }
}

/// Pump JSON between the websocket and the link until either side closes.
async fn bridge<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    peer: LinkPeer,
    session_update: serde_json::Value,
    remote_session: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let LinkPeer {
        inbound,
        mut outbound,
    } = peer;

    if let Err(e) = write.send(Message::Text(session_update.to_string())).await {
        warn!(remote_session = %remote_session, "session.update failed: {e}");
        return;
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let event: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("ignoring unparseable realtime event: {e}");
                            continue;
                        }
                    };
                    if inbound.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(remote_session = %remote_session, ?frame, "realtime link closed by service");
                    break;
                }
                Some(Err(e)) => {
                    warn!(remote_session = %remote_session, "realtime read error: {e}");
                    break;
                }
                None => break,
                _ => {}
            },
            event = outbound.recv() => match event {
                Some(event) => {
                    if let Err(e) = write.send(Message::Text(event.to_string())).await {
                        warn!(remote_session = %remote_session, "realtime send error: {e}");
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
    debug!(remote_session = %remote_session, "realtime bridge ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_message_is_extracted() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(extract_error_message(body), "Incorrect API key provided");
        assert_eq!(extract_error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn http_errors_become_credential_errors() {
        let err = RealtimeSpeechService::map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}");
        match err {
            VoxError::Credential(msg) => assert!(msg.contains("rate limit")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn realtime_url_carries_model() {
        let svc = RealtimeSpeechService::with_api_key(SpeechServiceConfig::default(), "sk-test");
        let url = svc.realtime_url("gpt-4o-realtime-preview").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
        assert_eq!(
            svc.sessions_url(),
            "https://api.openai.com/v1/realtime/sessions"
        );
    }
}
