//! Voice state reconciler.
//!
//! Owns the canonical [`VoiceState`]. Three unreliable channels feed it
//! (media element, session lifecycle, coordinator push), all normalized to
//! [`VoiceEvent`] first. Cross-channel disagreement is settled by the
//! delayed-stop check and the two watchdogs, never by comparing timestamps
//! from different channels.
//!
//! The reconciler runs as a single actor task. [`ReconcilerHandle`] is the
//! only way in; state is published through a `watch` channel.

mod delayed_stop;

pub use delayed_stop::{StopOutcome, StopPolicy, wait_for_playback_stop};

use crate::analyzer::{AnalyzerHandle, SourceNodeCache, start_analyzer};
use crate::config::{AnalyzerConfig, ReconcilerConfig};
use crate::error::{Result, VoxError};
use crate::events::VoiceEvent;
use crate::media::{MediaId, SharedMedia};
use crate::mouth::{MouthTarget, effective_mouth_value};
use crate::state::{VoiceFlags, VoiceState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Published reconciler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: VoiceState,
    /// Short user-facing message while in [`VoiceState::Error`].
    pub message: Option<String>,
}

/// Requests accepted by the reconciler actor.
pub enum ReconcilerCommand {
    Event(VoiceEvent),
    AttachMedia(SharedMedia),
    DetachMedia,
}

impl std::fmt::Debug for ReconcilerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Self::AttachMedia(media) => f.debug_tuple("AttachMedia").field(&media.id()).finish(),
            Self::DetachMedia => f.write_str("DetachMedia"),
        }
    }
}

#[derive(Debug)]
struct StopCompletion {
    generation: u64,
    outcome: StopOutcome,
}

#[derive(Debug)]
struct PendingStop {
    generation: u64,
    cancel: CancellationToken,
}

/// Reconciler state machine. Driven by [`Reconciler::run`].
pub struct Reconciler {
    config: ReconcilerConfig,
    analyzer_config: AnalyzerConfig,
    stop_policy: StopPolicy,
    flags: Arc<VoiceFlags>,
    mouth: MouthTarget,
    sources: Option<Arc<SourceNodeCache>>,
    media: Option<SharedMedia>,
    analyzer: Option<AnalyzerHandle>,
    analyzer_failed_for: Option<MediaId>,
    state_tx: watch::Sender<StateSnapshot>,
    stop_tx: mpsc::UnboundedSender<StopCompletion>,
    stop_rx: mpsc::UnboundedReceiver<StopCompletion>,
    pending_stop: Option<PendingStop>,
    stop_generation: u64,
    speaking_since: Option<Instant>,
    last_activity_at: Option<Instant>,
    last_position: Option<f64>,
    last_progress_at: Option<Instant>,
    /// Set when the element reported a pause or end and has not resumed.
    paused_since: Option<Instant>,
}

impl Reconciler {
    /// Spawn the reconciler actor and return its handle.
    ///
    /// `sources` enables the audio intensity analyzer; without it the
    /// watchdogs that depend on analyzer activity stay dormant.
    #[must_use]
    pub fn spawn(
        config: ReconcilerConfig,
        analyzer_config: AnalyzerConfig,
        sources: Option<Arc<SourceNodeCache>>,
    ) -> ReconcilerHandle {
        let flags = VoiceFlags::new();
        let mouth = MouthTarget::new();
        let (state_tx, state_rx) = watch::channel(StateSnapshot::default());
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel(64);

        let reconciler = Self {
            stop_policy: StopPolicy::from_config(&config),
            config,
            analyzer_config,
            flags: Arc::clone(&flags),
            mouth: mouth.clone(),
            sources,
            media: None,
            analyzer: None,
            analyzer_failed_for: None,
            state_tx,
            stop_tx,
            stop_rx,
            pending_stop: None,
            stop_generation: 0,
            speaking_since: None,
            last_activity_at: None,
            last_position: None,
            last_progress_at: None,
            paused_since: None,
        };
        tokio::spawn(reconciler.run(rx));

        ReconcilerHandle {
            tx,
            state_rx,
            flags,
            mouth,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ReconcilerCommand>) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                Some(done) = self.stop_rx.recv() => self.complete_stop(done),
                _ = tick.tick() => self.handle(VoiceEvent::Tick),
            }
        }

        self.cancel_pending_stop();
        self.stop_analyzer();
        debug!("reconciler actor stopped");
    }

    fn apply(&mut self, command: ReconcilerCommand) {
        match command {
            ReconcilerCommand::Event(event) => self.handle(event),
            ReconcilerCommand::AttachMedia(media) => self.attach_media(media),
            ReconcilerCommand::DetachMedia => self.detach_media(),
        }
    }

    fn state(&self) -> VoiceState {
        self.state_tx.borrow().state
    }

    fn handle(&mut self, event: VoiceEvent) {
        if !matches!(event, VoiceEvent::Tick | VoiceEvent::MediaTimeUpdate) {
            debug!(state = %self.state(), event = ?event, "reconciler event");
        }
        let now = Instant::now();

        match event {
            VoiceEvent::AgentStart => self.on_agent_start(),
            VoiceEvent::AgentEnd | VoiceEvent::AudioDone => self.on_agent_end(),
            VoiceEvent::MediaPaused | VoiceEvent::MediaEnded => {
                if self.media.is_some() {
                    self.paused_since.get_or_insert(now);
                }
                if self.state() == VoiceState::Speaking {
                    self.schedule_stop();
                }
            }
            VoiceEvent::MediaPlaying => {
                self.paused_since = None;
                self.last_position = None;
                self.ensure_analyzer();
            }
            VoiceEvent::MediaTimeUpdate => {
                self.sample_media(now);
                self.observe_activity();
                self.run_watchdogs(now);
            }
            VoiceEvent::MediaError(detail) => {
                self.fail(VoxError::Transport(format!("media element error: {detail}")));
            }
            VoiceEvent::TransportError { detail, message } => self.fail_with(&detail, message),
            VoiceEvent::ResponseCreated => {
                if self.state() != VoiceState::Speaking {
                    self.transition(VoiceState::Thinking, None);
                }
            }
            VoiceEvent::UserSpeechStarted | VoiceEvent::StartRecording => {
                if self.flags.voice_disabled() {
                    debug!("voice disabled; ignoring listening request");
                    return;
                }
                if self.state() == VoiceState::Speaking {
                    // Barge-in: the user talks over the assistant.
                    self.cancel_output();
                }
                self.transition(VoiceState::Listening, None);
            }
            VoiceEvent::UserSpeechStopped => {
                if self.state() == VoiceState::Listening {
                    self.transition(VoiceState::Thinking, None);
                }
            }
            VoiceEvent::StopRecording => {
                self.cancel_output();
                if matches!(self.state(), VoiceState::Listening | VoiceState::Speaking) {
                    self.transition(VoiceState::Idle, None);
                }
            }
            VoiceEvent::SessionReset => {
                self.cancel_output();
                self.transition(VoiceState::Retrying, None);
            }
            VoiceEvent::CredentialIssued { session_id } => {
                if matches!(self.state(), VoiceState::Retrying | VoiceState::Error) {
                    info!(session_id = %session_id, "fresh credential; recovering");
                    self.transition(VoiceState::Idle, None);
                }
            }
            VoiceEvent::Interrupt => {
                self.cancel_output();
                if matches!(self.state(), VoiceState::Speaking | VoiceState::Thinking) {
                    self.transition(VoiceState::Idle, None);
                }
            }
            VoiceEvent::Clear => {
                if let Some(media) = &self.media {
                    media.clear_queue();
                }
            }
            VoiceEvent::ResponseText { text, is_final } => {
                debug!(chars = text.len(), is_final, "response text");
            }
            VoiceEvent::SetVoiceDisabled(disabled) => self.set_voice_disabled(disabled),
            VoiceEvent::ForceIdle => self.force_idle(),
            VoiceEvent::Tick => {
                if self.flags.voice_disabled()
                    && (self.state().needs_voice() || self.flags.currently_speaking())
                {
                    self.enforce_voice_disabled();
                }
                self.sample_media(now);
                self.observe_activity();
                self.run_watchdogs(now);
                self.check_confirmed_pause(now);
            }
        }
    }

    fn on_agent_start(&mut self) {
        // A new turn supersedes any stop still waiting on the previous one.
        self.cancel_pending_stop();
        if self.flags.voice_disabled() {
            debug!("voice disabled; suppressing speaking");
            self.enforce_voice_disabled();
            return;
        }
        if self.flags.currently_speaking() {
            debug!("already speaking");
            return;
        }
        if let Some(media) = &self.media {
            media.set_muted(false);
        }
        self.transition(VoiceState::Speaking, None);
    }

    fn on_agent_end(&mut self) {
        match self.state() {
            VoiceState::Speaking => self.schedule_stop(),
            // Text-only turn: the response ended without audio.
            VoiceState::Thinking => self.transition(VoiceState::Idle, None),
            _ => {}
        }
    }

    fn transition(&mut self, next: VoiceState, message: Option<String>) {
        if next.needs_voice() && self.flags.voice_disabled() {
            self.enforce_voice_disabled();
            return;
        }

        let previous = self.state();
        let now = Instant::now();
        if next == VoiceState::Speaking {
            if !self.flags.swap_speaking(true) {
                self.speaking_since = Some(now);
            }
            self.ensure_analyzer();
        } else {
            self.flags.swap_speaking(false);
            self.speaking_since = None;
            self.mouth.zero(now);
        }

        let changed = self.state_tx.send_if_modified(|snapshot| {
            if snapshot.state == next && snapshot.message == message {
                return false;
            }
            snapshot.state = next;
            snapshot.message = message;
            true
        });
        if changed && previous != next {
            info!(from = %previous, to = %next, "voice state transition");
        }
    }

    fn fail(&mut self, error: VoxError) {
        self.fail_with(&error.to_string(), error.user_message().to_owned());
    }

    fn fail_with(&mut self, detail: &str, message: String) {
        warn!(error = %detail, "voice pipeline error");
        self.cancel_output();
        self.transition(VoiceState::Error, Some(message));
    }

    /// Mute and pause output, zero the mouth, drop queued audio, cancel the
    /// pending stop and the analyzer. Safe from any state.
    fn cancel_output(&mut self) {
        if let Some(media) = &self.media {
            media.set_muted(true);
            media.pause();
            media.clear_queue();
        }
        self.mouth.zero(Instant::now());
        self.cancel_pending_stop();
        self.stop_analyzer();
    }

    fn force_idle(&mut self) {
        self.cancel_pending_stop();
        self.mouth.zero(Instant::now());
        self.transition(VoiceState::Idle, None);
    }

    fn set_voice_disabled(&mut self, disabled: bool) {
        self.flags.set_voice_disabled(disabled);
        info!(disabled, "voice output toggled");
        if disabled {
            self.enforce_voice_disabled();
        } else if let Some(media) = &self.media {
            media.set_muted(false);
        }
    }

    fn enforce_voice_disabled(&mut self) {
        self.cancel_output();
        self.transition(VoiceState::Idle, None);
    }

    fn schedule_stop(&mut self) {
        if self.pending_stop.is_some() {
            debug!("delayed stop already pending");
            return;
        }
        self.stop_generation += 1;
        let generation = self.stop_generation;
        let cancel = CancellationToken::new();
        let media = self.media.clone();
        let policy = self.stop_policy;
        let tx = self.stop_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let outcome = wait_for_playback_stop(media, policy, token).await;
            let _ = tx.send(StopCompletion {
                generation,
                outcome,
            });
        });
        debug!(generation, "delayed stop scheduled");
        self.pending_stop = Some(PendingStop { generation, cancel });
    }

    fn cancel_pending_stop(&mut self) {
        if let Some(pending) = self.pending_stop.take() {
            pending.cancel.cancel();
            debug!(generation = pending.generation, "delayed stop cancelled");
        }
    }

    fn complete_stop(&mut self, done: StopCompletion) {
        let current = self.pending_stop.as_ref().map(|p| p.generation);
        if current != Some(done.generation) {
            debug!(generation = done.generation, "ignoring superseded stop check");
            return;
        }
        self.pending_stop = None;
        match done.outcome {
            StopOutcome::Cancelled => {}
            StopOutcome::TimedOut => {
                warn!("playback never settled; forcing idle");
                self.stop_if_speaking();
            }
            StopOutcome::Immediate | StopOutcome::Confirmed => self.stop_if_speaking(),
        }
    }

    /// A turn that started after the element had already paused gets no
    /// pause event of its own; stop it once the pause outlasts the grace window.
    fn check_confirmed_pause(&mut self, now: Instant) {
        let Some(since) = self.paused_since else {
            return;
        };
        if !self.media.as_ref().is_some_and(|m| m.paused()) {
            self.paused_since = None;
            return;
        }
        if self.state() != VoiceState::Speaking || self.pending_stop.is_some() {
            return;
        }
        let reference = self.speaking_since.map_or(since, |s| s.max(since));
        let grace = self.stop_policy.probe_window + self.stop_policy.poll_interval;
        if now.saturating_duration_since(reference) > grace {
            info!("speaking while media stays paused; scheduling stop");
            self.schedule_stop();
        }
    }

    fn stop_if_speaking(&mut self) {
        if self.state() == VoiceState::Speaking {
            self.transition(VoiceState::Idle, None);
        }
    }

    fn attach_media(&mut self, media: SharedMedia) {
        let id = media.id();
        let replaced = self.media.as_ref().map(|m| m.id());
        if replaced.as_ref() != Some(&id) {
            self.stop_analyzer();
            self.analyzer_failed_for = None;
        }
        if self.flags.voice_disabled() {
            media.set_muted(true);
        }
        info!(media = %id, "media element attached");
        self.media = Some(media);
        self.last_position = None;
        self.last_progress_at = None;
        self.paused_since = None;
        if self.state() == VoiceState::Speaking {
            self.ensure_analyzer();
        }
    }

    fn detach_media(&mut self) {
        if let Some(media) = self.media.take() {
            info!(media = %media.id(), "media element detached");
            if let Some(sources) = &self.sources {
                sources.release(&media.id());
            }
        }
        self.stop_analyzer();
        self.analyzer_failed_for = None;
        self.last_position = None;
        self.last_progress_at = None;
        self.paused_since = None;
    }

    fn ensure_analyzer(&mut self) {
        if self.analyzer.as_ref().is_some_and(AnalyzerHandle::is_running) {
            return;
        }
        let (Some(sources), Some(media)) = (&self.sources, &self.media) else {
            return;
        };
        let id = media.id();
        if self.analyzer_failed_for.as_ref() == Some(&id) {
            return;
        }
        match start_analyzer(sources, &id, &self.analyzer_config, self.mouth.clone()) {
            Ok(handle) => {
                self.last_activity_at = None;
                self.analyzer = Some(handle);
            }
            Err(_) => {
                // Already logged; keep reconciling without analyzer input.
                self.analyzer_failed_for = Some(id);
                self.analyzer = None;
            }
        }
    }

    fn stop_analyzer(&mut self) {
        if let Some(analyzer) = self.analyzer.take() {
            analyzer.stop();
        }
    }

    fn analyzer_running(&self) -> bool {
        self.analyzer.as_ref().is_some_and(AnalyzerHandle::is_running)
    }

    fn media_playing(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| !m.paused() && m.ready_state().has_data())
    }

    fn sample_media(&mut self, now: Instant) {
        let Some(media) = &self.media else {
            self.last_position = None;
            return;
        };
        let position = media.current_time();
        if self.last_position.is_some_and(|prev| position > prev) {
            self.last_progress_at = Some(now);
        }
        self.last_position = Some(position);
    }

    fn media_advancing(&self, now: Instant) -> bool {
        // Progress is sampled on ticks and time updates; allow two samples of slack.
        let window = self.config.tick_interval() * 2;
        self.media_playing()
            && self
                .last_progress_at
                .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }

    fn observe_activity(&mut self) {
        let frame = self.mouth.snapshot();
        if frame.value > self.config.activity_threshold {
            let newer = self.last_activity_at.is_none_or(|at| frame.updated_at > at);
            if newer {
                self.last_activity_at = Some(frame.updated_at);
            }
        }
    }

    fn run_watchdogs(&mut self, now: Instant) {
        if !self.analyzer_running() {
            return;
        }
        let state = self.state();

        if state == VoiceState::Speaking && self.media_playing() {
            let reference = match (self.last_activity_at, self.speaking_since) {
                (Some(a), Some(s)) => a.max(s),
                (Some(a), None) => a,
                (None, Some(s)) => s,
                (None, None) => now,
            };
            if now.saturating_duration_since(reference) > self.config.watchdog_silence() {
                warn!(
                    silent_ms = now.saturating_duration_since(reference).as_millis() as u64,
                    "no audio energy while playback is live; forcing idle"
                );
                self.force_idle();
            }
            return;
        }

        if matches!(state, VoiceState::Idle | VoiceState::Thinking)
            && !self.flags.voice_disabled()
            && self.media_advancing(now)
        {
            let frame = self.mouth.snapshot();
            let fresh = now.saturating_duration_since(frame.updated_at)
                <= self.config.activity_freshness();
            if fresh && frame.value > self.config.activity_threshold {
                info!("audio energy without agent start; resuming speaking");
                self.cancel_pending_stop();
                self.transition(VoiceState::Speaking, None);
            }
        }
    }
}

/// Cloneable handle to a running reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<ReconcilerCommand>,
    state_rx: watch::Receiver<StateSnapshot>,
    flags: Arc<VoiceFlags>,
    mouth: MouthTarget,
}

impl ReconcilerHandle {
    async fn send(&self, command: ReconcilerCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|e| VoxError::Channel(format!("reconciler stopped: {e}")))
    }

    /// Queue a normalized event.
    pub async fn dispatch(&self, event: VoiceEvent) -> Result<()> {
        self.send(ReconcilerCommand::Event(event)).await
    }

    /// Queue an event without waiting for capacity.
    pub fn try_dispatch(&self, event: VoiceEvent) -> Result<()> {
        self.tx
            .try_send(ReconcilerCommand::Event(event))
            .map_err(|e| VoxError::Channel(format!("reconciler queue: {e}")))
    }

    pub async fn attach_media(&self, media: SharedMedia) -> Result<()> {
        self.send(ReconcilerCommand::AttachMedia(media)).await
    }

    pub async fn detach_media(&self) -> Result<()> {
        self.send(ReconcilerCommand::DetachMedia).await
    }

    pub async fn force_idle(&self) -> Result<()> {
        self.dispatch(VoiceEvent::ForceIdle).await
    }

    pub async fn set_voice_disabled(&self, disabled: bool) -> Result<()> {
        self.dispatch(VoiceEvent::SetVoiceDisabled(disabled)).await
    }

    #[must_use]
    pub fn state(&self) -> VoiceState {
        self.state_rx.borrow().state
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.state_rx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn flags(&self) -> &Arc<VoiceFlags> {
        &self.flags
    }

    #[must_use]
    pub fn mouth(&self) -> &MouthTarget {
        &self.mouth
    }

    /// Mouth value a renderer should use right now.
    #[must_use]
    pub fn effective_mouth(&self) -> f32 {
        effective_mouth_value(self.state(), &self.mouth.snapshot())
    }

    /// Wait until the published state equals `target` or `timeout` elapses.
    pub async fn wait_for(&self, target: VoiceState, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.state == target))
            .await
            .map_err(|_| VoxError::Channel(format!("timed out waiting for {target}")))?
            .map(|_| ())
            .map_err(|e| VoxError::Channel(format!("reconciler stopped: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAudioGraph, FakeMedia};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn spawn_plain() -> ReconcilerHandle {
        Reconciler::spawn(ReconcilerConfig::default(), AnalyzerConfig::default(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn agent_start_enters_speaking_once() {
        let r = spawn_plain();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Speaking);
        assert!(r.flags().currently_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn agent_end_with_stalled_media_goes_idle() {
        let r = spawn_plain();
        r.attach_media(FakeMedia::idle("el").shared()).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::AgentEnd).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Idle);
        assert!(!r.flags().currently_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn agent_end_waits_for_playback_to_finish() {
        let r = spawn_plain();
        let media = FakeMedia::playing_for("el", Duration::from_secs(2));
        r.attach_media(media.shared()).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::AgentEnd).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(r.state(), VoiceState::Speaking);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(r.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_stops_are_harmless() {
        let r = spawn_plain();
        r.attach_media(FakeMedia::playing_for("el", Duration::from_millis(400)).shared())
            .await
            .unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::AgentEnd).await.unwrap();
        r.dispatch(VoiceEvent::AudioDone).await.unwrap();
        r.dispatch(VoiceEvent::AgentEnd).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(r.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn new_turn_cancels_pending_stop() {
        let r = spawn_plain();
        let media = FakeMedia::playing_for("el", Duration::from_millis(500));
        r.attach_media(media.shared()).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::AgentEnd).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        media.play_for(Duration::from_secs(5));
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(r.state(), VoiceState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_transitions() {
        let r = spawn_plain();
        r.dispatch(VoiceEvent::UserSpeechStarted).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Listening);
        r.dispatch(VoiceEvent::UserSpeechStopped).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Thinking);
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::ResponseCreated).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_surfaces_short_message() {
        let r = spawn_plain();
        r.dispatch(VoiceEvent::transport_error(&VoxError::Transport(
            "ICE failed on 10.1.2.3".into(),
        )))
        .await
        .unwrap();
        settle().await;
        let snap = r.snapshot();
        assert_eq!(snap.state, VoiceState::Error);
        let message = snap.message.unwrap();
        assert!(!message.contains("10.1.2.3"));

        r.dispatch(VoiceEvent::SessionReset).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Retrying);
        r.dispatch(VoiceEvent::CredentialIssued {
            session_id: "s".into(),
        })
        .await
        .unwrap();
        settle().await;
        assert_eq!(r.snapshot(), StateSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn voice_disabled_suppresses_listening_and_speaking() {
        let r = spawn_plain();
        r.set_voice_disabled(true).await.unwrap();
        r.dispatch(VoiceEvent::StartRecording).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Idle);
        assert!(r.flags().voice_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_output() {
        let r = spawn_plain();
        let media = FakeMedia::playing_for("el", Duration::from_secs(10));
        r.attach_media(media.shared()).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.dispatch(VoiceEvent::AgentEnd).await.unwrap();
        r.dispatch(VoiceEvent::Interrupt).await.unwrap();
        r.dispatch(VoiceEvent::Interrupt).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Idle);
        assert!(media.muted());
        assert!(media.pause_count() >= 1);
        assert!(media.clear_count() >= 1);
        assert_eq!(r.mouth().snapshot().value, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn force_idle_twice_matches_once() {
        let r = spawn_plain();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        r.force_idle().await.unwrap();
        settle().await;
        let once = r.snapshot();
        r.force_idle().await.unwrap();
        settle().await;
        assert_eq!(r.snapshot(), once);
        assert_eq!(once.state, VoiceState::Idle);
        assert!(!r.flags().currently_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn no_media_is_tolerated_everywhere() {
        let r = spawn_plain();
        for event in [
            VoiceEvent::MediaPlaying,
            VoiceEvent::MediaTimeUpdate,
            VoiceEvent::MediaPaused,
            VoiceEvent::MediaEnded,
            VoiceEvent::Clear,
            VoiceEvent::StopRecording,
            VoiceEvent::Interrupt,
            VoiceEvent::AgentEnd,
        ] {
            r.dispatch(event).await.unwrap();
        }
        r.detach_media().await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_starting_after_pause_does_not_stick_in_speaking() {
        let graph = FakeAudioGraph::new();
        let sources = SourceNodeCache::new(graph.clone());
        let r = Reconciler::spawn(
            ReconcilerConfig::default(),
            AnalyzerConfig::default(),
            Some(sources),
        );
        r.attach_media(FakeMedia::idle("el").shared()).await.unwrap();
        r.dispatch(VoiceEvent::MediaPlaying).await.unwrap();
        r.dispatch(VoiceEvent::MediaPaused).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Speaking);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(r.state(), VoiceState::Idle);
        assert!(!r.flags().currently_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn ended_media_then_late_agent_start_goes_idle() {
        let r = spawn_plain();
        let media = FakeMedia::playing_for("el", Duration::from_millis(300));
        r.attach_media(media.shared()).await.unwrap();
        r.dispatch(VoiceEvent::MediaPlaying).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        r.dispatch(VoiceEvent::MediaEnded).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(r.state(), VoiceState::Idle);

        // Resumed playback clears the pause, so a new turn keeps speaking.
        media.play_for(Duration::from_secs(5));
        r.dispatch(VoiceEvent::MediaPlaying).await.unwrap();
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(r.state(), VoiceState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_analyzer_watchdog_forces_idle() {
        let graph = FakeAudioGraph::new();
        let sources = SourceNodeCache::new(graph.clone());
        let r = Reconciler::spawn(
            ReconcilerConfig::default(),
            AnalyzerConfig::default(),
            Some(sources),
        );
        let media = FakeMedia::playing_for("el", Duration::from_secs(30));
        r.attach_media(media.shared()).await.unwrap();
        graph.tap().set_level(0.0);
        r.dispatch(VoiceEvent::AgentStart).await.unwrap();
        settle().await;
        assert_eq!(r.state(), VoiceState::Speaking);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(r.state(), VoiceState::Idle);
        assert_eq!(r.mouth().snapshot().value, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn live_energy_recovers_missed_agent_start() {
        let graph = FakeAudioGraph::new();
        let sources = SourceNodeCache::new(graph.clone());
        let r = Reconciler::spawn(
            ReconcilerConfig::default(),
            AnalyzerConfig::default(),
            Some(sources),
        );
        let media = FakeMedia::playing_for("el", Duration::from_secs(30));
        r.attach_media(media.shared()).await.unwrap();
        graph.tap().set_level(0.4);
        r.dispatch(VoiceEvent::MediaPlaying).await.unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(r.state(), VoiceState::Speaking);
        assert!(r.effective_mouth() > 0.0);
        assert_eq!(graph.created(), 1);
    }
}
