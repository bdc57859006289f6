//! Wire vocabulary and event normalization.
//!
//! Three shapes meet here:
//!
//! - [`PushEvent`]: what the coordinator fans out to subscribers.
//! - [`ClientRequest`]: what clients post to the coordinator.
//! - [`VoiceEvent`]: the single internal vocabulary the reconciler consumes.
//!
//! [`normalize_remote`] and [`normalize_push`] map the first two (and raw
//! speech-service events) onto the third so the reconciler never depends on
//! a wire format.

use crate::error::VoxError;
use serde::{Deserialize, Serialize};

/// Ephemeral client secret issued by the speech service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub value: String,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl Credential {
    /// Whether the credential has expired at `now_unix` seconds.
    #[must_use]
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_unix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Interrupt,
    Clear,
}

/// Out-of-band context fields, as carried by `external_text_available`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Sender-defined kind. Named `contextType` on the push channel because
    /// `type` is the event tag there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
}

impl ContextPayload {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.image.is_none() && self.prompt.is_none()
    }

    /// Text to hand to the model as a user message.
    #[must_use]
    pub fn as_message(&self) -> Option<String> {
        match (&self.prompt, &self.text) {
            (Some(prompt), Some(text)) => Some(format!("{prompt}\n\n{text}")),
            (Some(prompt), None) => Some(prompt.clone()),
            (None, Some(text)) => Some(text.clone()),
            (None, None) => None,
        }
    }
}

/// Event fanned out to every push-channel subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Connected,
    Ready,
    SessionInfo {
        #[serde(rename = "sessionId")]
        session_id: String,
        credential: Credential,
    },
    AgentStart,
    AudioDelta {
        delta: String,
    },
    AgentEnd,
    ResponseText {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    Control {
        command: ControlCommand,
    },
    ExternalDataReceived {
        #[serde(rename = "storageKey")]
        storage_key: String,
    },
    ExternalTextAvailable(ContextPayload),
    Error {
        message: String,
    },
    WorkerRestarting,
    WorkerRestarted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SessionIdleReset,
}

impl PushEvent {
    /// Event tag as it appears on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::SessionInfo { .. } => "session_info",
            Self::AgentStart => "agent_start",
            Self::AudioDelta { .. } => "audio_delta",
            Self::AgentEnd => "agent_end",
            Self::ResponseText { .. } => "response_text",
            Self::Control { .. } => "control",
            Self::ExternalDataReceived { .. } => "external_data_received",
            Self::ExternalTextAvailable(_) => "external_text_available",
            Self::Error { .. } => "error",
            Self::WorkerRestarting => "worker_restarting",
            Self::WorkerRestarted { .. } => "worker_restarted",
            Self::SessionIdleReset => "session_idle_reset",
        }
    }
}

/// Request posted by a client to `/api/message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Base64 PCM16 audio chunk.
    Audio { audio: String },
    Text { text: String },
    Control { command: ControlCommand },
    SwitchAgent {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    ConnectionReady,
}

/// Normalized event consumed by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    // Media graph.
    MediaPlaying,
    MediaPaused,
    MediaEnded,
    MediaTimeUpdate,
    MediaError(String),

    // Session lifecycle.
    AgentStart,
    AgentEnd,
    AudioDone,
    ResponseCreated,
    UserSpeechStarted,
    UserSpeechStopped,
    /// `detail` is for logs only; `message` is safe to show.
    TransportError { detail: String, message: String },
    SessionReset,
    CredentialIssued { session_id: String },

    // Push / control.
    Interrupt,
    Clear,
    ResponseText { text: String, is_final: bool },

    // Local commands.
    StartRecording,
    StopRecording,
    SetVoiceDisabled(bool),
    ForceIdle,
    Tick,
}

impl VoiceEvent {
    #[must_use]
    pub fn transport_error(err: &VoxError) -> Self {
        Self::TransportError {
            detail: err.to_string(),
            message: err.user_message().to_owned(),
        }
    }
}

/// Map a raw speech-service event (peer data channel or realtime link) onto
/// the internal vocabulary. Unknown events map to `None`.
#[must_use]
pub fn normalize_remote(event: &serde_json::Value) -> Option<VoiceEvent> {
    let kind = event.get("type")?.as_str()?;
    let text_field = |name: &str| {
        event
            .get(name)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    match kind {
        "output_audio_buffer.started" => Some(VoiceEvent::AgentStart),
        "output_audio_buffer.stopped" | "output_audio_buffer.cleared" | "response.audio.done" => {
            Some(VoiceEvent::AudioDone)
        }
        "response.created" => Some(VoiceEvent::ResponseCreated),
        "response.done" | "response.cancelled" => Some(VoiceEvent::AgentEnd),
        "input_audio_buffer.speech_started" => Some(VoiceEvent::UserSpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(VoiceEvent::UserSpeechStopped),
        "response.audio_transcript.delta" => Some(VoiceEvent::ResponseText {
            text: text_field("delta"),
            is_final: false,
        }),
        "response.audio_transcript.done" => Some(VoiceEvent::ResponseText {
            text: text_field("transcript"),
            is_final: true,
        }),
        "error" => {
            let message = event
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("speech service error")
                .to_owned();
            Some(VoiceEvent::transport_error(&VoxError::Transport(message)))
        }
        _ => None,
    }
}

/// Map a coordinator push event onto the internal vocabulary.
#[must_use]
pub fn normalize_push(event: &PushEvent) -> Option<VoiceEvent> {
    match event {
        PushEvent::AgentStart => Some(VoiceEvent::AgentStart),
        PushEvent::AgentEnd => Some(VoiceEvent::AgentEnd),
        PushEvent::ResponseText { text, is_final } => Some(VoiceEvent::ResponseText {
            text: text.clone(),
            is_final: *is_final,
        }),
        PushEvent::Control {
            command: ControlCommand::Interrupt,
        } => Some(VoiceEvent::Interrupt),
        PushEvent::Control {
            command: ControlCommand::Clear,
        } => Some(VoiceEvent::Clear),
        // Push errors already carry a user-facing message.
        PushEvent::Error { message } => Some(VoiceEvent::TransportError {
            detail: message.clone(),
            message: message.clone(),
        }),
        PushEvent::SessionInfo { session_id, .. } => Some(VoiceEvent::CredentialIssued {
            session_id: session_id.clone(),
        }),
        PushEvent::WorkerRestarting | PushEvent::SessionIdleReset => Some(VoiceEvent::SessionReset),
        PushEvent::Connected
        | PushEvent::Ready
        | PushEvent::AudioDelta { .. }
        | PushEvent::ExternalDataReceived { .. }
        | PushEvent::ExternalTextAvailable(_)
        | PushEvent::WorkerRestarted { .. } => None,
    }
}
