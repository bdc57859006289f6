//! voxsync: voice state reconciliation and realtime session coordination for
//! lip-synced voice avatars.
//!
//! # Architecture
//!
//! Client side:
//! - **Analyzer**: turns assistant audio into a gated, smoothed mouth openness
//! - **Mouth target**: throttled shared value read by a renderer
//! - **Reconciler**: the single owner of [`VoiceState`]; arbitrates analyzer
//!   activity, media element events, transport lifecycle and push events
//! - **Transport**: negotiates the peer audio session with coordinator-issued
//!   credentials and recovers stale sessions
//!
//! Server side:
//! - **Coordinator**: one logical session per instance, credential issuance,
//!   push fan-out, pending context, scheduled restart and idle reset
//! - **Server**: the coordinator's HTTP + SSE surface
//!
//! Platform audio and peer connections stay behind traits
//! ([`media::MediaElement`], [`media::AudioGraph`],
//! [`transport::PeerNegotiator`]); [`testing`] provides deterministic fakes.

pub mod analyzer;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fanout;
pub mod media;
pub mod mouth;
pub mod reconciler;
pub mod server;
pub mod speech;
pub mod state;
pub mod testing;
pub mod transport;

pub use client::{CoordinatorApi, HttpCoordinatorClient};
pub use config::VoxConfig;
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{Result, VoxError};
pub use events::{PushEvent, VoiceEvent};
pub use mouth::{MouthFrame, MouthTarget, effective_mouth_value};
pub use reconciler::{Reconciler, ReconcilerHandle};
pub use server::VoxServer;
pub use state::VoiceState;
pub use transport::{TransportHandle, TransportSessionManager};
