//! Error types for voxsync.

/// Top-level error type for the reconciler, analyzer, transport and coordinator.
#[derive(Debug, thiserror::Error)]
pub enum VoxError {
    /// Negotiation or network failure on the peer audio session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote speech service refused to issue a credential.
    #[error("credential error: {0}")]
    Credential(String),

    /// Negotiation failed because the remote session went stale.
    #[error("stale session: {0}")]
    StaleSession(String),

    /// Audio graph construction or analysis failure.
    #[error("analyzer error: {0}")]
    Analyzer(String),

    /// A single push-channel subscriber could not be delivered to.
    #[error("channel delivery error: {0}")]
    ChannelDelivery(String),

    /// Malformed client request or payload.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The speech service link is not connected yet.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Internal channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoxError {
    /// Short human-readable message suitable for the `error` voice state.
    ///
    /// Raw transport detail is never surfaced; callers log the full error.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Transport(_) => "Connection to the voice service was lost.",
            Self::Credential(_) => "The voice service refused to start a session.",
            Self::StaleSession(_) => "The voice session expired. Reconnecting.",
            Self::Analyzer(_) => "Audio analysis is unavailable.",
            Self::ChannelDelivery(_) => "A client stopped receiving updates.",
            Self::InvalidRequest(_) => "The request was not understood.",
            Self::NotConnected(_) => "The voice service is not connected yet.",
            Self::Config(_) => "The voice service is misconfigured.",
            Self::Channel(_) | Self::Io(_) => "Something went wrong. Please try again.",
        }
    }

    /// Whether the reset-and-retry path applies to this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::StaleSession(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoxError>;

/// Turn a remote HTTP status into a short description for logs and errors.
pub fn describe_http_status(status: u16) -> &'static str {
    match status {
        401 => "invalid API key or authentication failed",
        403 => "access denied, check API key permissions",
        429 => "rate limit exceeded",
        500 | 502 | 503 | 504 => "speech service temporarily unavailable",
        _ => "unexpected response from speech service",
    }
}
