//! Remote speech service adapter.
//!
//! The coordinator talks to the speech service through [`SpeechService`]:
//! one call issues an ephemeral client credential, another opens the
//! server-side realtime link used to forward text, audio and control.

mod realtime;

pub use realtime::RealtimeSpeechService;

use crate::config::{AgentProfile, SpeechServiceConfig};
use crate::error::{Result, VoxError};
use crate::events::Credential;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDetection {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    fn to_json(&self) -> Value {
        json!({
            "type": "server_vad",
            "threshold": self.threshold,
            "prefix_padding_ms": self.prefix_padding_ms,
            "silence_duration_ms": self.silence_duration_ms,
            "create_response": true,
            "interrupt_response": true,
        })
    }
}

/// Tunables sent when creating or updating a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub transcription_model: Option<String>,
    pub temperature: f32,
    pub turn_detection: TurnDetection,
}

impl SessionParams {
    #[must_use]
    pub fn from_config(config: &SpeechServiceConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: config.input_audio_format.clone(),
            output_audio_format: config.output_audio_format.clone(),
            transcription_model: config.transcription_model.clone(),
            temperature: config.temperature,
            turn_detection: TurnDetection {
                threshold: config.vad_threshold,
                prefix_padding_ms: config.vad_prefix_padding_ms,
                silence_duration_ms: config.vad_silence_duration_ms,
            },
        }
    }

    /// Overlay an agent profile.
    #[must_use]
    pub fn with_agent(mut self, agent: &AgentProfile) -> Self {
        self.instructions = agent.instructions.clone();
        if let Some(voice) = &agent.voice {
            self.voice = voice.clone();
        }
        self
    }

    /// Session fields shared by the credential request and `session.update`.
    #[must_use]
    pub fn session_fields(&self) -> Value {
        let mut fields = json!({
            "modalities": ["audio", "text"],
            "voice": self.voice,
            "instructions": self.instructions,
            "input_audio_format": self.input_audio_format,
            "output_audio_format": self.output_audio_format,
            "temperature": self.temperature,
            "turn_detection": self.turn_detection.to_json(),
        });
        if let Some(model) = &self.transcription_model {
            fields["input_audio_transcription"] = json!({ "model": model });
        }
        fields
    }
}

/// A session created on the speech service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub id: String,
    pub model: String,
    pub credential: Credential,
}

/// Outbound realtime events.
pub mod outbound {
    use serde_json::{Value, json};

    #[must_use]
    pub fn session_update(fields: Value) -> Value {
        json!({ "type": "session.update", "session": fields })
    }

    #[must_use]
    pub fn append_audio(base64_audio: &str) -> Value {
        json!({ "type": "input_audio_buffer.append", "audio": base64_audio })
    }

    #[must_use]
    pub fn clear_input() -> Value {
        json!({ "type": "input_audio_buffer.clear" })
    }

    #[must_use]
    pub fn user_message(text: &str) -> Value {
        json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            },
        })
    }

    #[must_use]
    pub fn create_response() -> Value {
        json!({ "type": "response.create" })
    }

    #[must_use]
    pub fn cancel_response() -> Value {
        json!({ "type": "response.cancel" })
    }
}

/// Bidirectional JSON event link to a live remote session.
///
/// Dropping the link closes the underlying connection.
#[derive(Debug)]
pub struct SpeechLink {
    outbound: mpsc::Sender<Value>,
    inbound: mpsc::Receiver<Value>,
}

/// The service side of a [`SpeechLink`].
#[derive(Debug)]
pub struct LinkPeer {
    pub inbound: mpsc::Sender<Value>,
    pub outbound: mpsc::Receiver<Value>,
}

impl SpeechLink {
    /// Create a connected link/peer pair.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }

    /// Send one event to the service.
    ///
    /// # Errors
    ///
    /// Returns [`VoxError::NotConnected`] if the connection has closed.
    pub async fn send(&self, event: Value) -> Result<()> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| VoxError::NotConnected("speech link closed".to_owned()))
    }

    /// Next event from the service; `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[async_trait]
pub trait SpeechService: Send + Sync + 'static {
    /// Create a session and issue an ephemeral client credential.
    async fn create_session(&self, params: &SessionParams) -> Result<RemoteSession>;

    /// Open the server-side realtime link for `session`.
    async fn connect(&self, session: &RemoteSession, params: &SessionParams)
    -> Result<SpeechLink>;
}
