//! Deterministic host fakes shared by unit tests, integration tests and
//! headless demos.
//!
//! Everything here reads `tokio::time::Instant`, so tests running on a paused
//! clock observe playback advancing exactly as far as the clock has moved.

use crate::error::{Result, VoxError};
use crate::events::Credential;
use crate::media::{AudioGraph, AudioTap, MediaElement, MediaId, ReadyState, SharedMedia};
use crate::speech::{LinkPeer, RemoteSession, SessionParams, SpeechLink, SpeechService};
use crate::transport::{PeerHealth, PeerLink, PeerNegotiator};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
struct Playback {
    /// Position at `started_at`.
    base: f64,
    started_at: Instant,
    /// `None` while playing means the position is stuck (buffer underrun).
    play_until: Option<Instant>,
    paused: bool,
    ready: ReadyState,
}

impl Playback {
    fn position(&self, now: Instant) -> f64 {
        if self.paused {
            return self.base;
        }
        match self.play_until {
            Some(until) => {
                let end = now.min(until);
                self.base + end.saturating_duration_since(self.started_at).as_secs_f64()
            }
            None => self.base,
        }
    }

    fn finished(&self, now: Instant) -> bool {
        self.play_until.is_some_and(|until| now >= until)
    }
}

/// Scriptable media element.
#[derive(Debug)]
pub struct FakeMedia {
    id: MediaId,
    playback: Mutex<Playback>,
    muted: AtomicBool,
    pauses: AtomicUsize,
    clears: AtomicUsize,
}

impl FakeMedia {
    fn build(id: &str, playback: Playback) -> Arc<Self> {
        Arc::new(Self {
            id: MediaId::from(id),
            playback: Mutex::new(playback),
            muted: AtomicBool::new(false),
            pauses: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
        })
    }

    /// Paused element with no data.
    #[must_use]
    pub fn idle(id: &str) -> Arc<Self> {
        Self::build(
            id,
            Playback {
                base: 0.0,
                started_at: Instant::now(),
                play_until: None,
                paused: true,
                ready: ReadyState::HaveNothing,
            },
        )
    }

    /// Unpaused element whose position never moves.
    #[must_use]
    pub fn frozen(id: &str, position: f64) -> Arc<Self> {
        Self::build(
            id,
            Playback {
                base: position,
                started_at: Instant::now(),
                play_until: None,
                paused: false,
                ready: ReadyState::HaveEnoughData,
            },
        )
    }

    /// Element that plays from now for `duration`, then ends.
    #[must_use]
    pub fn playing_for(id: &str, duration: Duration) -> Arc<Self> {
        let now = Instant::now();
        Self::build(
            id,
            Playback {
                base: 0.0,
                started_at: now,
                play_until: Some(now + duration),
                paused: false,
                ready: ReadyState::HaveEnoughData,
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, Playback> {
        lock(&self.playback)
    }

    #[must_use]
    pub fn shared(self: &Arc<Self>) -> SharedMedia {
        Arc::clone(self) as SharedMedia
    }

    /// Resume from the current position for another `duration`.
    pub fn play_for(&self, duration: Duration) {
        let now = Instant::now();
        let mut p = self.lock();
        p.base = p.position(now);
        p.started_at = now;
        p.play_until = Some(now + duration);
        p.paused = false;
        p.ready = ReadyState::HaveEnoughData;
    }

    pub fn set_ready_state(&self, ready: ReadyState) {
        self.lock().ready = ready;
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl MediaElement for FakeMedia {
    fn id(&self) -> MediaId {
        self.id.clone()
    }

    fn paused(&self) -> bool {
        let p = self.lock();
        p.paused || p.finished(Instant::now())
    }

    fn current_time(&self) -> f64 {
        self.lock().position(Instant::now())
    }

    fn ready_state(&self) -> ReadyState {
        self.lock().ready
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn pause(&self) {
        let now = Instant::now();
        let mut p = self.lock();
        p.base = p.position(now);
        p.started_at = now;
        p.paused = true;
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_queue(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Analysis tap producing a square wave whose RMS equals the set level.
#[derive(Debug, Default)]
pub struct LevelTap {
    level_bits: AtomicU32,
}

impl LevelTap {
    pub fn set_level(&self, level: f32) {
        self.level_bits.store(level.to_bits(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::SeqCst))
    }
}

impl AudioTap for LevelTap {
    fn read_time_domain(&self, buf: &mut [f32]) -> usize {
        let level = self.level();
        for (i, sample) in buf.iter_mut().enumerate() {
            *sample = if i % 2 == 0 { level } else { -level };
        }
        buf.len()
    }
}

/// Audio graph handing out one shared [`LevelTap`].
#[derive(Debug, Default)]
pub struct FakeAudioGraph {
    tap: Arc<LevelTap>,
    created: AtomicUsize,
    fail: AtomicBool,
}

impl FakeAudioGraph {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn tap(&self) -> Arc<LevelTap> {
        Arc::clone(&self.tap)
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl AudioGraph for FakeAudioGraph {
    fn create_source(&self, media: &MediaId) -> Result<Arc<dyn AudioTap>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoxError::Analyzer(format!(
                "cannot attach source node to {media}"
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.tap) as Arc<dyn AudioTap>)
    }
}

/// In-process speech service. Sessions are numbered from 1; credentials are
/// `ek_test_<n>`.
#[derive(Debug, Default)]
pub struct FakeSpeechService {
    created: AtomicUsize,
    fail_sessions: AtomicBool,
    fail_connect: AtomicBool,
    credential_ttl_secs: Mutex<Option<i64>>,
    issued_over_open_link: AtomicUsize,
    sent: Arc<Mutex<Vec<Value>>>,
    peer_inbound: Mutex<Option<mpsc::Sender<Value>>>,
}

impl FakeSpeechService {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Issue credentials that expire `ttl` seconds after creation.
    pub fn credential_ttl(&self, ttl: Option<i64>) {
        *lock(&self.credential_ttl_secs) = ttl;
    }

    /// Sessions created while the previous realtime link was still open.
    #[must_use]
    pub fn issued_over_open_link(&self) -> usize {
        self.issued_over_open_link.load(Ordering::SeqCst)
    }

    /// Every event the coordinator sent over its realtime links.
    #[must_use]
    pub fn sent_events(&self) -> Vec<Value> {
        lock(&self.sent).clone()
    }

    /// Deliver `event` on the current realtime link.
    pub async fn emit(&self, event: Value) {
        let tx = lock(&self.peer_inbound).clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Close the current realtime link from the service side.
    pub fn close_link(&self) {
        lock(&self.peer_inbound).take();
    }
}

#[async_trait]
impl SpeechService for FakeSpeechService {
    async fn create_session(&self, params: &SessionParams) -> Result<RemoteSession> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(VoxError::Credential(
                "invalid API key or authentication failed (HTTP 401)".to_owned(),
            ));
        }
        let link_open = lock(&self.peer_inbound)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed());
        if link_open {
            self.issued_over_open_link.fetch_add(1, Ordering::SeqCst);
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let expires_at = lock(&self.credential_ttl_secs).map(|ttl| Utc::now().timestamp() + ttl);
        Ok(RemoteSession {
            id: format!("sess_{n}"),
            model: params.model.clone(),
            credential: Credential {
                value: format!("ek_test_{n}"),
                expires_at,
            },
        })
    }

    async fn connect(
        &self,
        _session: &RemoteSession,
        _params: &SessionParams,
    ) -> Result<SpeechLink> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(VoxError::Transport("realtime endpoint refused".to_owned()));
        }
        let (link, peer) = SpeechLink::pair(64);
        let LinkPeer {
            inbound,
            mut outbound,
        } = peer;
        *lock(&self.peer_inbound) = Some(inbound);
        let sent = Arc::clone(&self.sent);
        tokio::spawn(async move {
            while let Some(event) = outbound.recv().await {
                lock(&sent).push(event);
            }
        });
        Ok(link)
    }
}

/// Scriptable peer negotiator. Every link it hands out shares one health
/// value, settable from the test.
#[derive(Debug, Default)]
pub struct FakePeerNegotiator {
    failures: Mutex<VecDeque<String>>,
    credentials: Mutex<Vec<String>>,
    health: Arc<Mutex<PeerHealth>>,
    events: Mutex<Option<mpsc::Sender<Value>>>,
}

impl FakePeerNegotiator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next negotiation with a transport error carrying `detail`.
    pub fn fail_next(&self, detail: &str) {
        lock(&self.failures).push_back(detail.to_owned());
    }

    /// Number of negotiation attempts so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        lock(&self.credentials).len()
    }

    /// Credential values presented, in order.
    #[must_use]
    pub fn credentials_seen(&self) -> Vec<String> {
        lock(&self.credentials).clone()
    }

    pub fn set_health(&self, health: PeerHealth) {
        *lock(&self.health) = health;
    }

    /// Deliver a data-channel event on the current link.
    pub async fn emit(&self, event: Value) {
        let tx = lock(&self.events).clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl PeerNegotiator for FakePeerNegotiator {
    async fn negotiate(&self, credential: &Credential) -> Result<Box<dyn PeerLink>> {
        lock(&self.credentials).push(credential.value.clone());
        if let Some(detail) = lock(&self.failures).pop_front() {
            return Err(VoxError::Transport(detail));
        }
        *lock(&self.health) = PeerHealth::Connected;
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.events) = Some(tx);
        Ok(Box::new(FakePeerLink {
            health: Arc::clone(&self.health),
            events: rx,
        }))
    }
}

struct FakePeerLink {
    health: Arc<Mutex<PeerHealth>>,
    events: mpsc::Receiver<Value>,
}

#[async_trait]
impl PeerLink for FakePeerLink {
    fn health(&self) -> PeerHealth {
        *lock(&self.health)
    }

    async fn next_event(&mut self) -> Option<Value> {
        self.events.recv().await
    }
}
