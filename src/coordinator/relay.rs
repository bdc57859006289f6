//! Maps realtime link events onto push events.

use crate::error::VoxError;
use crate::events::PushEvent;
use serde_json::Value;
use tracing::{debug, warn};

/// Per-session relay state.
#[derive(Debug, Default)]
pub struct RemoteRelay {
    audio_started: bool,
}

impl RemoteRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push events produced by one remote event, in delivery order.
    pub fn map(&mut self, event: &Value) -> Vec<PushEvent> {
        let Some(kind) = event.get("type").and_then(Value::as_str) else {
            return Vec::new();
        };
        let field = |name: &str| {
            event
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        match kind {
            "response.created" => {
                self.audio_started = false;
                Vec::new()
            }
            "response.audio.delta" => {
                let mut out = Vec::with_capacity(2);
                if !self.audio_started {
                    self.audio_started = true;
                    out.push(PushEvent::AgentStart);
                }
                out.push(PushEvent::AudioDelta {
                    delta: field("delta"),
                });
                out
            }
            "response.audio_transcript.delta" => vec![PushEvent::ResponseText {
                text: field("delta"),
                is_final: false,
            }],
            "response.audio_transcript.done" => vec![PushEvent::ResponseText {
                text: field("transcript"),
                is_final: true,
            }],
            "response.done" | "response.cancelled" => {
                self.audio_started = false;
                vec![PushEvent::AgentEnd]
            }
            "error" => {
                let detail = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("speech service error");
                warn!(detail, "speech service reported an error");
                vec![PushEvent::Error {
                    message: VoxError::Transport(detail.to_owned())
                        .user_message()
                        .to_owned(),
                }]
            }
            other => {
                debug!(event = other, "remote event not relayed");
                Vec::new()
            }
        }
    }
}
