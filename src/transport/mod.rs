//! Transport session manager.
//!
//! Owns the client's peer audio session: fetches a credential from the
//! coordinator, negotiates the peer link, and recovers from stale sessions by
//! resetting and retrying exactly once. Lifecycle changes, peer data-channel
//! events and coordinator pushes all reach the reconciler as
//! [`VoiceEvent`]s.

use crate::client::{CoordinatorApi, PushStream};
use crate::config::TransportConfig;
use crate::error::{Result, VoxError};
use crate::events::{Credential, PushEvent, VoiceEvent, normalize_push, normalize_remote};
use crate::reconciler::ReconcilerHandle;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state of a negotiated peer link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerHealth {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerHealth {
    #[must_use]
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::New | Self::Connecting | Self::Connected)
    }
}

/// A live peer audio session, implemented by the host.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Current connection/ICE state.
    fn health(&self) -> PeerHealth;

    /// Next data-channel event; `None` once the channel has closed.
    async fn next_event(&mut self) -> Option<Value>;
}

/// Opens peer audio sessions with a coordinator-issued credential.
#[async_trait]
pub trait PeerNegotiator: Send + Sync + 'static {
    async fn negotiate(&self, credential: &Credential) -> Result<Box<dyn PeerLink>>;
}

const STALE_SIGNATURES: &[&str] = &[
    "setremotedescription",
    "m-line",
    "description mismatch",
    "negotiation mismatch",
    "does not match",
    "session not found",
];

/// Reclassify a negotiation failure whose message points at a stale remote
/// session.
#[must_use]
pub fn classify_negotiation_error(err: VoxError) -> VoxError {
    match err {
        VoxError::Transport(detail) if is_stale_signature(&detail) => {
            VoxError::StaleSession(detail)
        }
        other => other,
    }
}

fn is_stale_signature(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    STALE_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
    Failed,
}

pub struct TransportSessionManager {
    config: TransportConfig,
    coordinator: Arc<dyn CoordinatorApi>,
    negotiator: Arc<dyn PeerNegotiator>,
    reconciler: ReconcilerHandle,
    peer: Option<Box<dyn PeerLink>>,
    session_id: Option<String>,
    status_tx: watch::Sender<TransportStatus>,
}

impl TransportSessionManager {
    #[must_use]
    pub fn new(
        config: TransportConfig,
        coordinator: Arc<dyn CoordinatorApi>,
        negotiator: Arc<dyn PeerNegotiator>,
        reconciler: ReconcilerHandle,
    ) -> Self {
        let (status_tx, _) = watch::channel(TransportStatus::Disconnected);
        Self {
            config,
            coordinator,
            negotiator,
            reconciler,
            peer: None,
            session_id: None,
            status_tx,
        }
    }

    #[must_use]
    pub fn status(&self) -> TransportStatus {
        *self.status_tx.borrow()
    }

    /// Session id of the current peer link.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn set_status(&self, status: TransportStatus) {
        self.status_tx.send_replace(status);
    }

    async fn notify(&self, event: VoiceEvent) {
        if let Err(e) = self.reconciler.dispatch(event).await {
            debug!(error = %e, "reconciler gone; event dropped");
        }
    }

    fn close_peer(&mut self) {
        if self.peer.take().is_some() {
            debug!(session_id = ?self.session_id, "peer link closed");
        }
    }

    /// Establish the peer session, resetting and retrying once on a
    /// recoverable failure.
    ///
    /// # Errors
    ///
    /// Returns the final error when the retry also fails, or immediately for
    /// non-recoverable failures such as a refused credential.
    pub async fn connect(&mut self) -> Result<()> {
        self.set_status(TransportStatus::Connecting);
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => self.recover(e).await,
        }
    }

    async fn establish(&mut self) -> Result<()> {
        self.close_peer();
        let info = self.coordinator.connection_ready().await?;
        let peer = self
            .negotiator
            .negotiate(&info.credential)
            .await
            .map_err(classify_negotiation_error)?;
        self.peer = Some(peer);
        info!(session_id = %info.session_id, "peer session established");
        self.session_id = Some(info.session_id.clone());
        self.set_status(TransportStatus::Connected);
        self.notify(VoiceEvent::CredentialIssued {
            session_id: info.session_id,
        })
        .await;
        Ok(())
    }

    async fn recover(&mut self, err: VoxError) -> Result<()> {
        if !err.is_recoverable() {
            return Err(self.surface(err).await);
        }
        let stale = matches!(err, VoxError::StaleSession(_));
        warn!(error = %err, stale, "peer session failed; resetting and retrying once");
        self.set_status(TransportStatus::Recovering);
        self.close_peer();
        self.notify(VoiceEvent::SessionReset).await;

        match self.coordinator.reset_session().await {
            Ok(session_id) => debug!(session_id = %session_id, "coordinator session reset"),
            Err(e) => warn!(error = %e, "session reset request failed"),
        }
        tokio::time::sleep(self.config.reset_settle()).await;

        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.surface(e).await),
        }
    }

    async fn surface(&mut self, err: VoxError) -> VoxError {
        error!(error = %err, "peer session unavailable");
        self.close_peer();
        self.set_status(TransportStatus::Failed);
        self.notify(VoiceEvent::transport_error(&err)).await;
        err
    }

    async fn health_check(&mut self) {
        let health = self.peer.as_ref().map(|peer| peer.health());
        match health {
            Some(health) if health.is_healthy() => {
                debug!(?health, "peer health ok");
            }
            Some(health) => {
                warn!(?health, "peer health check failed");
                let _ = self
                    .recover(VoxError::Transport(format!("peer connection {health:?}")))
                    .await;
            }
            None => {
                info!("no peer session; reconnecting");
                let _ = self.connect().await;
            }
        }
    }

    async fn on_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::WorkerRestarting | PushEvent::SessionIdleReset => {
                info!(kind = event.kind(), "coordinator recycled the session; re-requesting");
                self.close_peer();
                self.notify(VoiceEvent::SessionReset).await;
                let _ = self.connect().await;
            }
            // Credentials are applied when this manager negotiates them.
            PushEvent::SessionInfo { .. } => {}
            other => {
                if let Some(voice) = normalize_push(&other) {
                    self.notify(voice).await;
                }
            }
        }
    }

    async fn open_push(&self) -> Option<PushStream> {
        match self.coordinator.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "push channel unavailable");
                None
            }
        }
    }

    /// Run the manager as a background task.
    #[must_use]
    pub fn spawn(self) -> TransportHandle {
        let cancel = CancellationToken::new();
        let status = self.status_tx.subscribe();
        let task = tokio::spawn(self.run(cancel.clone()));
        TransportHandle {
            cancel,
            status,
            task,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut push = self.open_push().await;
        if let Err(e) = self.connect().await {
            warn!(error = %e, "initial peer session failed");
        }

        let period = self.config.health_check_interval();
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = next_push(&mut push) => match event {
                    Some(event) => self.on_push(event).await,
                    None => {
                        warn!("push channel closed; reopening on next health check");
                        push = None;
                    }
                },
                event = next_peer_event(&mut self.peer) => match event {
                    Some(event) => {
                        if let Some(voice) = normalize_remote(&event) {
                            self.notify(voice).await;
                        }
                    }
                    None => {
                        let _ = self
                            .recover(VoxError::Transport("peer data channel closed".to_owned()))
                            .await;
                    }
                },
                _ = health.tick() => {
                    if push.is_none() {
                        push = self.open_push().await;
                    }
                    self.health_check().await;
                }
            }
        }

        self.close_peer();
        self.set_status(TransportStatus::Disconnected);
        info!("transport session manager stopped");
    }
}

async fn next_push(push: &mut Option<PushStream>) -> Option<PushEvent> {
    match push.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_peer_event(peer: &mut Option<Box<dyn PeerLink>>) -> Option<Value> {
    match peer.as_mut() {
        Some(peer) => peer.next_event().await,
        None => std::future::pending().await,
    }
}

/// Handle to a running [`TransportSessionManager`].
#[derive(Debug)]
pub struct TransportHandle {
    cancel: CancellationToken,
    status: watch::Receiver<TransportStatus>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    #[must_use]
    pub fn status(&self) -> TransportStatus {
        *self.status.borrow()
    }

    /// Wait until the manager reports `target` or `timeout` elapses.
    pub async fn wait_for(&self, target: TransportStatus, timeout: Duration) -> Result<()> {
        let mut rx = self.status.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map_err(|_| VoxError::Channel(format!("timed out waiting for {target:?}")))?
            .map(|_| ())
            .map_err(|e| VoxError::Channel(format!("transport manager stopped: {e}")))
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "transport task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyzerConfig, ReconcilerConfig, VoxConfig};
    use crate::coordinator::Coordinator;
    use crate::reconciler::Reconciler;
    use crate::speech::SpeechService;
    use crate::state::VoiceState;
    use crate::testing::{FakePeerNegotiator, FakeSpeechService};
    use serde_json::json;

    struct Rig {
        service: Arc<FakeSpeechService>,
        negotiator: Arc<FakePeerNegotiator>,
        reconciler: ReconcilerHandle,
        manager: TransportSessionManager,
    }

    fn rig_with(config: &VoxConfig) -> Rig {
        let service = FakeSpeechService::new();
        let coordinator =
            Coordinator::spawn(config, Arc::clone(&service) as Arc<dyn SpeechService>).unwrap();
        let negotiator = FakePeerNegotiator::new();
        let reconciler =
            Reconciler::spawn(ReconcilerConfig::default(), AnalyzerConfig::default(), None);
        let manager = TransportSessionManager::new(
            config.transport.clone(),
            Arc::new(coordinator),
            Arc::clone(&negotiator) as Arc<dyn PeerNegotiator>,
            reconciler.clone(),
        );
        Rig {
            service,
            negotiator,
            reconciler,
            manager,
        }
    }

    fn rig() -> Rig {
        rig_with(&VoxConfig::default())
    }

    #[test]
    fn stale_signatures_are_classified() {
        let err = classify_negotiation_error(VoxError::Transport(
            "Failed to execute 'setRemoteDescription': m-lines order mismatch".into(),
        ));
        assert!(matches!(err, VoxError::StaleSession(_)));
        let err = classify_negotiation_error(VoxError::Transport("ICE timeout".into()));
        assert!(matches!(err, VoxError::Transport(_)));
        let err = classify_negotiation_error(VoxError::Credential("401".into()));
        assert!(matches!(err, VoxError::Credential(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_issued_credential() {
        let mut rig = rig();
        rig.manager.connect().await.unwrap();
        assert_eq!(rig.manager.status(), TransportStatus::Connected);
        assert_eq!(rig.negotiator.credentials_seen(), vec!["ek_test_1"]);
        assert!(rig.manager.session_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_resets_and_retries_once() {
        let mut rig = rig();
        rig.negotiator
            .fail_next("setRemoteDescription failed: m-lines order mismatch");

        let started = Instant::now();
        rig.manager.connect().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1_500));
        assert_eq!(
            rig.negotiator.credentials_seen(),
            vec!["ek_test_1", "ek_test_2"]
        );
        assert_eq!(rig.service.sessions_created(), 2);
        rig.reconciler
            .wait_for(VoiceState::Idle, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_surfaces_error() {
        let mut rig = rig();
        rig.negotiator.fail_next("description mismatch");
        rig.negotiator.fail_next("description mismatch");

        let err = rig.manager.connect().await.unwrap_err();
        assert!(matches!(err, VoxError::StaleSession(_)));
        assert_eq!(rig.negotiator.attempts(), 2);
        assert_eq!(rig.manager.status(), TransportStatus::Failed);
        rig.reconciler
            .wait_for(VoiceState::Error, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!rig.reconciler.snapshot().message.unwrap_or_default().contains("mismatch"));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_credential_is_not_retried() {
        let mut rig = rig();
        rig.service.fail_sessions(true);
        let err = rig.manager.connect().await.unwrap_err();
        assert!(matches!(err, VoxError::Credential(_)));
        assert_eq!(rig.negotiator.attempts(), 0);
        assert_eq!(rig.manager.status(), TransportStatus::Failed);
        rig.reconciler
            .wait_for(VoiceState::Error, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            rig.reconciler.snapshot().message.as_deref(),
            Some("The voice service refused to start a session.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_health_check_triggers_reset_and_retry() {
        let rig = rig();
        let negotiator = Arc::clone(&rig.negotiator);
        let service = Arc::clone(&rig.service);
        let handle = rig.manager.spawn();
        handle
            .wait_for(TransportStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();

        negotiator.set_health(PeerHealth::Failed);
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(negotiator.attempts(), 2);
        assert_eq!(service.sessions_created(), 2);
        assert_eq!(handle.status(), TransportStatus::Connected);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn worker_restart_rerequests_session() {
        let mut config = VoxConfig::default();
        config.coordinator.restart_interval_secs = 60;
        let rig = rig_with(&config);
        let negotiator = Arc::clone(&rig.negotiator);
        let service = Arc::clone(&rig.service);
        let handle = rig.manager.spawn();
        handle
            .wait_for(TransportStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(service.sessions_created(), 2);
        assert_eq!(
            negotiator.credentials_seen(),
            vec!["ek_test_1", "ek_test_2"]
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn peer_events_reach_reconciler() {
        let rig = rig();
        let negotiator = Arc::clone(&rig.negotiator);
        let reconciler = rig.reconciler.clone();
        let handle = rig.manager.spawn();
        handle
            .wait_for(TransportStatus::Connected, Duration::from_secs(1))
            .await
            .unwrap();

        negotiator
            .emit(json!({"type": "input_audio_buffer.speech_started"}))
            .await;
        reconciler
            .wait_for(VoiceState::Listening, Duration::from_secs(1))
            .await
            .unwrap();
        negotiator
            .emit(json!({"type": "input_audio_buffer.speech_stopped"}))
            .await;
        reconciler
            .wait_for(VoiceState::Thinking, Duration::from_secs(1))
            .await
            .unwrap();
        handle.shutdown().await;
    }
}
