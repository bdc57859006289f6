//! Canonical voice state and the shared flags every component reads.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Conversational state published by the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Error,
    Retrying,
}

impl VoiceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
            Self::Retrying => "retrying",
        }
    }

    /// States that require voice to be enabled.
    #[must_use]
    pub fn needs_voice(self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cross-component flags shared by reference.
///
/// Readers may inspect the flags from anywhere. Writes are `pub(crate)` and
/// are performed by the reconciler's transition function only.
#[derive(Debug, Default)]
pub struct VoiceFlags {
    voice_disabled: AtomicBool,
    currently_speaking: AtomicBool,
}

impl VoiceFlags {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn voice_disabled(&self) -> bool {
        self.voice_disabled.load(Ordering::SeqCst)
    }

    pub fn currently_speaking(&self) -> bool {
        self.currently_speaking.load(Ordering::SeqCst)
    }

    pub(crate) fn set_voice_disabled(&self, disabled: bool) {
        self.voice_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Set the speaking latch. Returns the previous value.
    pub(crate) fn swap_speaking(&self, speaking: bool) -> bool {
        self.currently_speaking.swap(speaking, Ordering::SeqCst)
    }
}
