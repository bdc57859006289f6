//! Session coordinator.
//!
//! Keeps exactly one logical session per instance, brokers ephemeral speech
//! credentials, owns the push-channel subscriber set and replays pending
//! context. Runs as a single actor task: every request, timer and realtime
//! link event is handled in turn, so session state is never mutated in
//! parallel.
//!
//! ```text
//! uninitialized -> issuing_credential -> session_ready
//!       ^                                     |
//!       +---- idle_reset | scheduled_restart | explicit_reset
//! ```

mod context_store;
mod relay;

pub use context_store::{ContextStore, PendingContext};
pub use relay::RemoteRelay;

use crate::config::{AgentProfile, CoordinatorConfig, SpeechServiceConfig, VoxConfig};
use crate::error::{Result, VoxError};
use crate::events::{ClientRequest, ContextPayload, ControlCommand, Credential, PushEvent};
use crate::fanout::{ChannelSink, SubscriberSet};
use crate::speech::{RemoteSession, SessionParams, SpeechLink, SpeechService, outbound};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coordinator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    IssuingCredential,
    SessionReady,
}

/// Credential handed to a client for its peer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub credential: Credential,
}

/// Outcome of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Accepted,
    Session(SessionInfo),
}

/// Outcome of a context submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextOutcome {
    Injected,
    Stored { storage_key: String },
}

/// Per-session counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub session_id: String,
    pub phase: Phase,
    pub connected: bool,
    pub subscribers: usize,
    pub agent: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub audio_bytes: u64,
    pub messages: u64,
    pub control_commands: u64,
    pub context_injections: u64,
    pub pending_contexts: usize,
}

#[derive(Debug, Default)]
struct Counters {
    audio_bytes: u64,
    messages: u64,
    control_commands: u64,
    context_injections: u64,
}

struct LiveSession {
    remote: RemoteSession,
    created_at: DateTime<Utc>,
    link: Option<SpeechLink>,
    relay: RemoteRelay,
}

enum Request {
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Message {
        request: ClientRequest,
        reply: oneshot::Sender<Result<MessageOutcome>>,
    },
    Context {
        payload: ContextPayload,
        reply: oneshot::Sender<Result<ContextOutcome>>,
    },
    Reset {
        reply: oneshot::Sender<String>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

/// Live push-channel subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    events: mpsc::Receiver<PushEvent>,
    departures: mpsc::UnboundedSender<Uuid>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next pushed event; `None` once the coordinator dropped this subscriber.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.departures.send(self.id);
    }
}

/// Cloneable handle to the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Request>,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl CoordinatorHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|e| VoxError::Channel(format!("coordinator stopped: {e}")))?;
        reply_rx
            .await
            .map_err(|e| VoxError::Channel(format!("coordinator reply dropped: {e}")))
    }

    /// Open a push-channel subscription. The first event is `connected`.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.call(|reply| Request::Subscribe { reply }).await
    }

    /// Handle a client request.
    pub async fn message(&self, request: ClientRequest) -> Result<MessageOutcome> {
        self.call(|reply| Request::Message { request, reply })
            .await?
    }

    /// Ensure a live session exists and return its credential.
    pub async fn connection_ready(&self) -> Result<SessionInfo> {
        match self.message(ClientRequest::ConnectionReady).await? {
            MessageOutcome::Session(info) => Ok(info),
            MessageOutcome::Accepted => Err(VoxError::Channel(
                "connection_ready returned no session".to_owned(),
            )),
        }
    }

    /// Submit out-of-band context.
    pub async fn submit_context(&self, payload: ContextPayload) -> Result<ContextOutcome> {
        self.call(|reply| Request::Context { payload, reply })
            .await?
    }

    /// Tear down the session; returns the fresh session id.
    pub async fn reset(&self) -> Result<String> {
        self.call(|reply| Request::Reset { reply }).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats> {
        self.call(|reply| Request::Stats { reply }).await
    }
}

/// The coordinator actor.
pub struct Coordinator {
    config: CoordinatorConfig,
    speech_config: SpeechServiceConfig,
    agents: BTreeMap<String, AgentProfile>,
    speech: Arc<dyn SpeechService>,
    subscribers: SubscriberSet,
    departures_tx: mpsc::UnboundedSender<Uuid>,
    store: ContextStore,
    phase: Phase,
    session_id: String,
    live: Option<LiveSession>,
    agent: Option<String>,
    counters: Counters,
    last_activity: Option<DateTime<Utc>>,
    next_restart: Instant,
    idle_deadline: Option<Instant>,
    replay_deadlines: VecDeque<Instant>,
}

impl Coordinator {
    /// Spawn the coordinator actor.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted context store cannot be loaded.
    pub fn spawn(config: &VoxConfig, speech: Arc<dyn SpeechService>) -> Result<CoordinatorHandle> {
        let store = match &config.coordinator.context_store_path {
            Some(path) => ContextStore::open(path)?,
            None => ContextStore::in_memory(),
        };
        let (tx, rx) = mpsc::channel(config.coordinator.request_capacity.max(1));
        let (departures_tx, departures_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config: config.coordinator.clone(),
            speech_config: config.speech.clone(),
            agents: config.agents.clone(),
            speech,
            subscribers: SubscriberSet::new(),
            departures_tx,
            store,
            phase: Phase::Uninitialized,
            session_id: Uuid::new_v4().to_string(),
            live: None,
            agent: None,
            counters: Counters::default(),
            last_activity: None,
            next_restart: Instant::now() + config.coordinator.restart_interval(),
            idle_deadline: None,
            replay_deadlines: VecDeque::new(),
        };
        info!(session_id = %coordinator.session_id, "session coordinator starting");
        tokio::spawn(coordinator.run(rx, departures_rx));
        Ok(CoordinatorHandle { tx })
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut departures: mpsc::UnboundedReceiver<Uuid>,
    ) {
        loop {
            let idle_at = self.idle_deadline;
            let replay_at = self.replay_deadlines.front().copied();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(id) = departures.recv() => self.on_departure(id),
                _ = tokio::time::sleep_until(self.next_restart) => self.scheduled_restart(),
                _ = sleep_or_pending(idle_at) => self.idle_reset(),
                _ = sleep_or_pending(replay_at) => {
                    self.replay_deadlines.pop_front();
                    self.replay_pending().await;
                }
                event = next_link_event(&mut self.live) => self.on_link_event(event),
            }
        }
        self.teardown();
        info!("session coordinator stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Subscribe { reply } => {
                let subscription = self.subscribe();
                let id = subscription.id;
                if reply.send(subscription).is_err() {
                    // The drop guard has already queued a departure for `id`.
                    debug!(subscriber = %id, "subscriber went away before reply");
                }
            }
            Request::Message { request, reply } => {
                self.touch();
                let result = self.handle_message(request).await;
                let _ = reply.send(result);
            }
            Request::Context { payload, reply } => {
                self.touch();
                let result = self.handle_context(payload).await;
                let _ = reply.send(result);
            }
            Request::Reset { reply } => {
                self.teardown();
                self.session_id = Uuid::new_v4().to_string();
                info!(session_id = %self.session_id, "explicit session reset");
                let _ = reply.send(self.session_id.clone());
            }
            Request::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    fn subscribe(&mut self) -> Subscription {
        let (sink, events) = ChannelSink::new(self.config.subscriber_capacity);
        let id = self.subscribers.add(Arc::new(sink));
        self.subscribers.send_to(id, &PushEvent::Connected);
        if self.idle_deadline.take().is_some() {
            debug!("subscriber returned; idle reset cancelled");
        }
        info!(subscriber = %id, total = self.subscribers.len(), "push subscriber connected");
        Subscription {
            id,
            events,
            departures: self.departures_tx.clone(),
        }
    }

    fn on_departure(&mut self, id: Uuid) {
        if self.subscribers.remove(id) {
            info!(subscriber = %id, total = self.subscribers.len(), "push subscriber left");
        }
        self.arm_idle_timer();
    }

    fn arm_idle_timer(&mut self) {
        if self.subscribers.is_empty() && self.idle_deadline.is_none() && self.live.is_some() {
            debug!(grace_secs = self.config.idle_grace_secs, "no subscribers; idle timer armed");
            self.idle_deadline = Some(Instant::now() + self.config.idle_grace());
        }
    }

    fn broadcast(&mut self, event: &PushEvent) {
        let report = self.subscribers.broadcast(event);
        if report.pruned > 0 {
            self.arm_idle_timer();
        }
    }

    fn is_ready(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.link.as_ref().is_some_and(|l| !l.is_closed()))
    }

    fn link(&self) -> Result<&SpeechLink> {
        self.live
            .as_ref()
            .and_then(|live| live.link.as_ref())
            .ok_or_else(|| VoxError::NotConnected("speech service not connected".to_owned()))
    }

    fn session_params(&self) -> SessionParams {
        let params = SessionParams::from_config(&self.speech_config);
        match self.agent.as_ref().and_then(|name| self.agents.get(name)) {
            Some(profile) => params.with_agent(profile),
            None => params,
        }
    }

    fn session_info(&self) -> Option<SessionInfo> {
        self.live.as_ref().map(|live| SessionInfo {
            session_id: self.session_id.clone(),
            credential: live.remote.credential.clone(),
        })
    }

    async fn handle_message(&mut self, request: ClientRequest) -> Result<MessageOutcome> {
        match request {
            ClientRequest::ConnectionReady => {
                self.ensure_session().await.map(MessageOutcome::Session)
            }
            ClientRequest::Audio { audio } => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(audio.as_bytes())
                    .map_err(|e| VoxError::InvalidRequest(format!("audio is not base64: {e}")))?;
                if decoded.is_empty() {
                    return Err(VoxError::InvalidRequest("empty audio chunk".to_owned()));
                }
                self.link()?.send(outbound::append_audio(&audio)).await?;
                self.counters.audio_bytes += decoded.len() as u64;
                Ok(MessageOutcome::Accepted)
            }
            ClientRequest::Text { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(VoxError::InvalidRequest("missing text".to_owned()));
                }
                let link = self.link()?;
                link.send(outbound::user_message(text)).await?;
                link.send(outbound::create_response()).await?;
                self.counters.messages += 1;
                Ok(MessageOutcome::Accepted)
            }
            ClientRequest::Control { command } => {
                let event = match command {
                    ControlCommand::Interrupt => outbound::cancel_response(),
                    ControlCommand::Clear => outbound::clear_input(),
                };
                if let Ok(link) = self.link() {
                    link.send(event).await?;
                }
                self.counters.control_commands += 1;
                info!(?command, "control command");
                self.broadcast(&PushEvent::Control { command });
                Ok(MessageOutcome::Accepted)
            }
            ClientRequest::SwitchAgent { agent_id } => {
                if !self.agents.contains_key(&agent_id) {
                    return Err(VoxError::InvalidRequest(format!("unknown agent {agent_id}")));
                }
                self.agent = Some(agent_id.clone());
                if let Ok(link) = self.link() {
                    let params = self.session_params();
                    link.send(outbound::session_update(params.session_fields()))
                        .await?;
                }
                info!(agent = %agent_id, "agent switched");
                Ok(MessageOutcome::Accepted)
            }
        }
    }

    async fn ensure_session(&mut self) -> Result<SessionInfo> {
        let now_unix = Utc::now().timestamp();
        let expired = self
            .live
            .as_ref()
            .is_some_and(|live| live.remote.credential.is_expired(now_unix));
        if expired {
            info!(session_id = %self.session_id, "credential expired; reissuing");
            self.teardown();
            self.session_id = Uuid::new_v4().to_string();
        }

        if self.live.is_some() {
            if !self.is_ready() && self.reconnect_link().await {
                self.replay_pending().await;
                self.arm_replay_retries();
            }
            if let Some(info) = self.session_info() {
                self.push_session(&info);
                return Ok(info);
            }
        }

        self.phase = Phase::IssuingCredential;
        let params = self.session_params();
        let remote = match self.speech.create_session(&params).await {
            Ok(remote) => remote,
            Err(e) => {
                error!(error = %e, "credential issuance failed");
                self.phase = Phase::Uninitialized;
                self.broadcast(&PushEvent::Error {
                    message: e.user_message().to_owned(),
                });
                return Err(e);
            }
        };

        let link = match self.speech.connect(&remote, &params).await {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(error = %e, "realtime link unavailable; client audio still works");
                None
            }
        };
        self.live = Some(LiveSession {
            remote,
            created_at: Utc::now(),
            link,
            relay: RemoteRelay::new(),
        });
        self.counters = Counters::default();
        self.phase = Phase::SessionReady;
        info!(session_id = %self.session_id, "session ready");

        let info = self
            .session_info()
            .ok_or_else(|| VoxError::Channel("session vanished during issuance".to_owned()))?;
        self.push_session(&info);
        self.broadcast(&PushEvent::Ready);

        self.replay_pending().await;
        self.arm_replay_retries();
        self.arm_idle_timer();
        Ok(info)
    }

    fn arm_replay_retries(&mut self) {
        if self.store.is_empty() {
            self.replay_deadlines.clear();
            return;
        }
        let now = Instant::now();
        self.replay_deadlines = self
            .config
            .context_retry_delays_ms
            .iter()
            .map(|ms| now + Duration::from_millis(*ms))
            .collect();
    }

    fn push_session(&mut self, info: &SessionInfo) {
        self.broadcast(&PushEvent::SessionInfo {
            session_id: info.session_id.clone(),
            credential: info.credential.clone(),
        });
    }

    /// Reopen the realtime link of the live session. Returns whether it is up.
    async fn reconnect_link(&mut self) -> bool {
        let params = self.session_params();
        let Some(live) = self.live.as_mut() else {
            return false;
        };
        match self.speech.connect(&live.remote, &params).await {
            Ok(link) => {
                info!(remote_session = %live.remote.id, "realtime link re-established");
                live.link = Some(link);
                true
            }
            Err(e) => {
                warn!(error = %e, "realtime link still unavailable");
                false
            }
        }
    }

    async fn handle_context(&mut self, payload: ContextPayload) -> Result<ContextOutcome> {
        if payload.is_empty() {
            return Err(VoxError::InvalidRequest(
                "context needs text, image or prompt".to_owned(),
            ));
        }
        if self.is_ready() {
            self.inject(&payload).await?;
            return Ok(ContextOutcome::Injected);
        }
        let storage_key = self.store.insert(payload, Utc::now());
        info!(storage_key = %storage_key, "context stored until the realtime link is ready");
        self.broadcast(&PushEvent::ExternalDataReceived {
            storage_key: storage_key.clone(),
        });
        Ok(ContextOutcome::Stored { storage_key })
    }

    async fn inject(&mut self, payload: &ContextPayload) -> Result<()> {
        if let Some(message) = payload.as_message() {
            self.link()?.send(outbound::user_message(&message)).await?;
        }
        self.broadcast(&PushEvent::ExternalTextAvailable(payload.clone()));
        self.counters.context_injections += 1;
        Ok(())
    }

    /// Replay the newest pending context and discard the older entries, so a
    /// stored payload is injected at most once.
    async fn replay_pending(&mut self) {
        if !self.is_ready() {
            return;
        }
        let Some((key, entry)) = self.store.latest() else {
            return;
        };
        let key = key.to_owned();
        let payload = entry.payload.clone();
        match self.inject(&payload).await {
            Ok(()) => {
                info!(storage_key = %key, discarded = self.store.len() - 1, "pending context replayed");
                self.store.clear();
                self.replay_deadlines.clear();
            }
            Err(e) => warn!(storage_key = %key, error = %e, "context replay failed; will retry"),
        }
    }

    fn on_link_event(&mut self, event: Option<serde_json::Value>) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let Some(event) = event else {
            warn!(remote_session = %live.remote.id, "realtime link closed");
            live.link = None;
            self.broadcast(&PushEvent::Error {
                message: VoxError::NotConnected(String::new())
                    .user_message()
                    .to_owned(),
            });
            return;
        };
        let pushes = live.relay.map(&event);
        for push in pushes {
            self.broadcast(&push);
        }
    }

    fn scheduled_restart(&mut self) {
        info!(session_id = %self.session_id, "scheduled restart");
        self.broadcast(&PushEvent::WorkerRestarting);
        self.teardown();
        self.session_id = Uuid::new_v4().to_string();
        self.next_restart = Instant::now() + self.config.restart_interval();
        self.broadcast(&PushEvent::WorkerRestarted {
            session_id: self.session_id.clone(),
        });
    }

    fn idle_reset(&mut self) {
        self.idle_deadline = None;
        if !self.subscribers.is_empty() {
            return;
        }
        info!(session_id = %self.session_id, "no subscribers after grace; resetting session");
        self.teardown();
        self.session_id = Uuid::new_v4().to_string();
        self.broadcast(&PushEvent::SessionIdleReset);
    }

    /// Drop the live session, closing its realtime link first.
    fn teardown(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.link.take();
            debug!(remote_session = %live.remote.id, "session torn down");
        }
        self.phase = Phase::Uninitialized;
        self.replay_deadlines.clear();
        self.idle_deadline = None;
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            session_id: self.session_id.clone(),
            phase: self.phase,
            connected: self.is_ready(),
            subscribers: self.subscribers.len(),
            agent: self.agent.clone(),
            created_at: self.live.as_ref().map(|l| l.created_at),
            last_activity: self.last_activity,
            audio_bytes: self.counters.audio_bytes,
            messages: self.counters.messages,
            control_commands: self.counters.control_commands,
            context_injections: self.counters.context_injections,
            pending_contexts: self.store.len(),
        }
    }
}

async fn sleep_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Next realtime event; `None` when the link closes. Pending without a link.
async fn next_link_event(live: &mut Option<LiveSession>) -> Option<serde_json::Value> {
    match live.as_mut().and_then(|l| l.link.as_mut()) {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}
