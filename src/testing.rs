//! In-memory stand-ins for the output device, catalog, announcer and store,
//! plus a fully wired scheduler rig.
//!
//! Locators look like `mem://name#120000`: the number after `#` is the
//! duration the fake output reports. A locator containing `broken` never
//! loads. Positions follow tokio time, so paused-clock tests drive them.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    audio::{deck::DeckState, AudioOutput, DeckEngine, DeckId, DeckSnapshot, EngineEvent},
    catalog::{SelectionQuery, Track, TrackCatalog},
    clock::{Clock, TokioClock},
    config::{EngineConfig, SchedulerConfig, WatchdogConfig},
    db::{RotationSnapshot, ShowStore},
    error::{Error, Result},
    events::EventBus,
    gateway::{
        announcer::{AnnouncementAsset, AnnouncementGateway, AnnouncementRequest},
        remote::{Command, CommandAction},
    },
    scheduler::{
        rotation::{Performer, PerformerId},
        selection::TrackSelector,
        show::{RotationScheduler, SchedulerDeps, SchedulerEvent, SchedulerHandle},
        transition::TransitionLock,
        watchdog::Watchdog,
    },
};

pub fn track(name: &str, duration_ms: u64) -> Track {
    Track {
        key: format!("key-{name}"),
        name: name.to_string(),
        locator: format!("mem://{name}#{duration_ms}"),
        genre: None,
        duration_ms: Some(duration_ms),
        feature: false,
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FakeDeck {
    state: DeckState,
    duration_ms: Option<u64>,
    gain: f32,
    played_ms: u64,
    running_since: Option<Instant>,
}

impl Default for FakeDeck {
    fn default() -> Self {
        Self {
            state: DeckState::Idle,
            duration_ms: None,
            gain: 0.0,
            played_ms: 0,
            running_since: None,
        }
    }
}

impl FakeDeck {
    fn position_ms(&self) -> u64 {
        let running = self
            .running_since
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let pos = self.played_ms + running;
        self.duration_ms.map_or(pos, |d| pos.min(d))
    }

    fn freeze(&mut self) {
        self.played_ms = self.position_ms();
        self.running_since = None;
    }
}

#[derive(Default)]
struct FakeOutputState {
    decks: HashMap<DeckId, FakeDeck>,
    /// Music deck loads, failed ones included.
    loads: Vec<(DeckId, String)>,
    fail_loads: usize,
    stalled: bool,
    master: f32,
}

/// Output device that plays nothing but keeps time.
#[derive(Default)]
pub struct FakeOutput {
    inner: Mutex<FakeOutputState>,
}

impl FakeOutput {
    pub fn state(&self, deck: DeckId) -> DeckState {
        let st = self.inner.lock().unwrap();
        st.decks.get(&deck).map(|d| d.state).unwrap_or(DeckState::Idle)
    }

    pub fn gain(&self, deck: DeckId) -> f32 {
        let st = self.inner.lock().unwrap();
        st.decks.get(&deck).map(|d| d.gain).unwrap_or(0.0)
    }

    /// The next `n` music-deck loads fail.
    pub fn fail_next_loads(&self, n: usize) {
        self.inner.lock().unwrap().fail_loads = n;
    }

    pub fn loads(&self) -> Vec<(DeckId, String)> {
        self.inner.lock().unwrap().loads.clone()
    }

    /// Freeze every playhead, as a wedged device would.
    pub fn set_stalled(&self, stalled: bool) {
        let mut st = self.inner.lock().unwrap();
        if st.stalled == stalled {
            return;
        }
        st.stalled = stalled;
        for deck in st.decks.values_mut() {
            if deck.state != DeckState::Playing {
                continue;
            }
            if stalled {
                deck.freeze();
            } else {
                deck.running_since = Some(Instant::now());
            }
        }
    }

    pub fn master_volume(&self) -> f32 {
        self.inner.lock().unwrap().master
    }
}

impl AudioOutput for FakeOutput {
    fn load(&self, deck: DeckId, locator: &str) -> Result<Option<u64>> {
        let mut st = self.inner.lock().unwrap();
        if deck != DeckId::Voice {
            st.loads.push((deck, locator.to_string()));
            if st.fail_loads > 0 {
                st.fail_loads -= 1;
                return Err(Error::AudioOutput(format!("simulated failure loading {locator}")));
            }
        }
        if locator.contains("broken") {
            return Err(Error::Decode(format!("unreadable {locator}")));
        }
        let duration_ms = locator
            .rsplit_once('#')
            .and_then(|(_, ms)| ms.parse::<u64>().ok());
        let slot = st.decks.entry(deck).or_default();
        *slot = FakeDeck {
            state: DeckState::Ready,
            duration_ms,
            gain: slot.gain,
            played_ms: 0,
            running_since: None,
        };
        Ok(duration_ms)
    }

    fn play(&self, deck: DeckId) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        let stalled = st.stalled;
        let slot = st.decks.entry(deck).or_default();
        match slot.state {
            DeckState::Ready | DeckState::Paused => {
                slot.state = DeckState::Playing;
                slot.running_since = (!stalled).then(Instant::now);
                Ok(())
            }
            DeckState::Playing => Ok(()),
            DeckState::Idle | DeckState::Stopped => {
                Err(Error::AudioOutput(format!("{deck}: nothing loaded")))
            }
        }
    }

    fn pause(&self, deck: DeckId) {
        let mut st = self.inner.lock().unwrap();
        if let Some(slot) = st.decks.get_mut(&deck) {
            if slot.state == DeckState::Playing {
                slot.freeze();
                slot.state = DeckState::Paused;
            }
        }
    }

    fn stop(&self, deck: DeckId) {
        let mut st = self.inner.lock().unwrap();
        let slot = st.decks.entry(deck).or_default();
        slot.state = DeckState::Stopped;
        slot.played_ms = 0;
        slot.running_since = None;
    }

    fn seek(&self, deck: DeckId, position_ms: u64) -> Result<()> {
        let mut st = self.inner.lock().unwrap();
        let stalled = st.stalled;
        let slot = st
            .decks
            .get_mut(&deck)
            .filter(|d| !matches!(d.state, DeckState::Idle | DeckState::Stopped))
            .ok_or_else(|| Error::AudioOutput(format!("{deck}: nothing to seek")))?;
        slot.played_ms = position_ms;
        slot.running_since = (slot.state == DeckState::Playing && !stalled).then(Instant::now);
        Ok(())
    }

    fn set_gain(&self, deck: DeckId, gain: f32) {
        let mut st = self.inner.lock().unwrap();
        st.decks.entry(deck).or_default().gain = gain;
    }

    fn set_master_volume(&self, volume: f32) {
        self.inner.lock().unwrap().master = volume;
    }

    fn snapshot(&self, deck: DeckId) -> DeckSnapshot {
        let st = self.inner.lock().unwrap();
        let Some(slot) = st.decks.get(&deck) else {
            return DeckSnapshot::idle();
        };
        let position_ms = slot.position_ms();
        DeckSnapshot {
            state: slot.state,
            position_ms,
            duration_ms: slot.duration_ms,
            finished: slot.state == DeckState::Playing
                && slot.duration_ms.is_some_and(|d| position_ms >= d),
        }
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

pub struct FakeCatalog {
    tracks: Vec<Track>,
    failing: AtomicBool,
    hanging: AtomicBool,
    limit: AtomicUsize,
    queries: Mutex<Vec<SelectionQuery>>,
}

impl FakeCatalog {
    pub fn with_tracks(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            limit: AtomicUsize::new(usize::MAX),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// `song-01` .. `song-NN`, two minutes each.
    pub fn library(n: usize) -> Self {
        Self::with_tracks(
            (1..=n)
                .map(|i| track(&format!("song-{i:02}"), 120_000))
                .collect(),
        )
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Requests never answer.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Cap every answer at `n` tracks.
    pub fn limit_results(&self, n: usize) {
        self.limit.store(n, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<SelectionQuery> {
        self.queries.lock().unwrap().clone()
    }

    async fn gate(&self) -> Result<()> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Catalog("catalog offline".into()));
        }
        Ok(())
    }

    fn cap(&self, count: usize) -> usize {
        count.min(self.limit.load(Ordering::SeqCst))
    }
}

fn in_genres(track: &Track, genres: &[String]) -> bool {
    genres.is_empty()
        || track
            .genre
            .as_deref()
            .is_some_and(|g| genres.iter().any(|w| w.eq_ignore_ascii_case(g)))
}

#[async_trait]
impl TrackCatalog for FakeCatalog {
    async fn select_tracks(&self, query: &SelectionQuery) -> Result<Vec<Track>> {
        self.gate().await?;
        self.queries.lock().unwrap().push(query.clone());
        let eligible: Vec<&Track> = self
            .tracks
            .iter()
            .filter(|t| !query.exclude_names.contains(&t.name) && in_genres(t, &query.genres))
            .collect();
        let preferred = query
            .preferred
            .iter()
            .filter_map(|name| eligible.iter().find(|t| &t.name == name).copied());
        let mut out: Vec<Track> = Vec::new();
        for t in preferred.chain(eligible.iter().copied()) {
            if !out.iter().any(|o| o.name == t.name) {
                out.push(t.clone());
            }
        }
        out.truncate(self.cap(query.count));
        Ok(out)
    }

    async fn random_tracks(
        &self,
        count: usize,
        exclude_keys: &[String],
        genres: &[String],
    ) -> Result<Vec<Track>> {
        self.gate().await?;
        Ok(self
            .tracks
            .iter()
            .filter(|t| !exclude_keys.contains(&t.key) && in_genres(t, genres))
            .take(self.cap(count))
            .cloned()
            .collect())
    }

    async fn resolve_by_name(&self, name: &str) -> Result<Option<Track>> {
        self.gate().await?;
        Ok(self.tracks.iter().find(|t| t.name == name).cloned())
    }
}

// ── Announcer ─────────────────────────────────────────────────────────────────

pub struct FakeAnnouncer {
    failing: AtomicBool,
    duration_ms: u64,
    requests: Mutex<Vec<AnnouncementRequest>>,
}

impl Default for FakeAnnouncer {
    fn default() -> Self {
        Self {
            failing: AtomicBool::new(false),
            duration_ms: 6_000,
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl FakeAnnouncer {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<AnnouncementRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnnouncementGateway for FakeAnnouncer {
    async fn announcement_asset(&self, request: &AnnouncementRequest) -> Result<AnnouncementAsset> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Announcement("gateway offline".into()));
        }
        Ok(AnnouncementAsset {
            locator: format!("ann://{}#{}", request.kind, self.duration_ms),
            duration_ms: Some(self.duration_ms),
        })
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    rotation: Mutex<Option<RotationSnapshot>>,
    cooldowns: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn seed_rotation(&self, order: Vec<PerformerId>, current_index: usize) {
        *self.rotation.lock().unwrap() = Some(RotationSnapshot {
            order,
            current_index,
        });
    }

    pub fn rotation(&self) -> Option<RotationSnapshot> {
        self.rotation.lock().unwrap().clone()
    }

    pub fn seed_cooldown(&self, name: &str, played_at_ms: u64) {
        self.cooldowns
            .lock()
            .unwrap()
            .insert(name.to_string(), played_at_ms);
    }

    pub fn cooldown(&self, name: &str) -> Option<u64> {
        self.cooldowns.lock().unwrap().get(name).copied()
    }
}

#[async_trait]
impl ShowStore for MemoryStore {
    async fn save_rotation_state(&self, order: &[PerformerId], current_index: usize) -> Result<()> {
        self.seed_rotation(order.to_vec(), current_index);
        Ok(())
    }

    async fn load_rotation_state(&self) -> Result<Option<RotationSnapshot>> {
        Ok(self.rotation())
    }

    async fn save_cooldown(&self, track_name: &str, played_at_ms: u64) -> Result<()> {
        self.seed_cooldown(track_name, played_at_ms);
        Ok(())
    }

    async fn load_cooldowns(&self) -> Result<HashMap<String, u64>> {
        Ok(self.cooldowns.lock().unwrap().clone())
    }
}

// ── Scheduler rig ─────────────────────────────────────────────────────────────

/// A scheduler wired to fakes, driven by calling `dispatch` directly.
pub struct ShowRig {
    pub sched: RotationScheduler,
    pub handle: SchedulerHandle,
    pub engine: DeckEngine,
    pub engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    pub output: Arc<FakeOutput>,
    pub catalog: Arc<FakeCatalog>,
    pub announcer: Arc<FakeAnnouncer>,
    pub store: Arc<MemoryStore>,
    pub selector: Arc<TrackSelector>,
    pub lock: TransitionLock,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub acks: mpsc::UnboundedReceiver<u64>,
}

impl ShowRig {
    /// Ava, Bea, Cleo (one song per set) and the inactive Dee.
    pub fn performers() -> Vec<Performer> {
        let p = |id, name: &str, songs_per_set, active| Performer {
            id,
            name: name.to_string(),
            playlist: vec!["song-05".into(), "song-06".into()],
            active,
            songs_per_set,
        };
        vec![
            p(1, "Ava", None, true),
            p(2, "Bea", None, true),
            p(3, "Cleo", Some(1), true),
            p(4, "Dee", None, false),
        ]
    }

    pub fn new(config: SchedulerConfig) -> Self {
        let library = (1..=30)
            .map(|i| track(&format!("song-{i:02}"), 120_000))
            .collect();
        Self::with_catalog(config, library)
    }

    pub fn with_catalog(config: SchedulerConfig, tracks: Vec<Track>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let output = Arc::new(FakeOutput::default());
        let (engine, engine_events) =
            DeckEngine::new(output.clone(), EngineConfig::default(), clock.clone());
        let catalog = Arc::new(FakeCatalog::with_tracks(tracks));
        let announcer = Arc::new(FakeAnnouncer::default());
        let store = Arc::new(MemoryStore::default());
        let selector = Arc::new(TrackSelector::new(
            catalog.clone(),
            store.clone(),
            clock.clone(),
            &config,
        ));
        let lock = TransitionLock::new(clock.clone(), config.stale_transition_ms);
        let bus = EventBus::new(256);
        let (ack_tx, acks) = mpsc::unbounded_channel();
        let gateway: Arc<dyn AnnouncementGateway> = announcer.clone();

        let (sched, handle) = RotationScheduler::new(
            config,
            Self::performers(),
            vec![1, 2],
            SchedulerDeps {
                engine: engine.clone(),
                selector: selector.clone(),
                announcer: Some(gateway),
                store: store.clone(),
                clock: clock.clone(),
                lock: lock.clone(),
                bus: bus.clone(),
                acks: Some(ack_tx),
            },
        );

        Self {
            sched,
            handle,
            engine,
            engine_events,
            output,
            catalog,
            announcer,
            store,
            selector,
            lock,
            bus,
            clock,
            acks,
        }
    }

    /// Report the track on air as finished.
    pub async fn end_current(&mut self) {
        let play_id = self.engine.active_play_id().expect("a track on air");
        self.sched
            .dispatch(SchedulerEvent::TrackEnded { play_id })
            .await;
    }

    pub async fn command(&mut self, id: u64, action: CommandAction) {
        let received_ms = self.clock.now_ms();
        self.sched
            .dispatch(SchedulerEvent::Command {
                command: Command {
                    id,
                    action,
                    timestamp_ms: received_ms,
                },
                received_ms,
            })
            .await;
    }

    pub fn watchdog(&self, config: WatchdogConfig) -> Watchdog {
        Watchdog::new(
            config,
            self.engine.clone(),
            self.selector.clone(),
            self.lock.clone(),
            self.handle.clone(),
            self.clock.clone(),
            self.bus.clone(),
        )
    }
}
