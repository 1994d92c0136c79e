use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::{interval, Instant, MissedTickBehavior},
};

use super::{
    crossfade::{fade_in_gain, fade_out_gain, ramp_level, switch_window_ms, DeckId, RampKind, TrackTiming},
    deck::DeckState,
    output::AudioOutput,
};
use crate::{
    catalog::Track, clock::Clock, config::EngineConfig, gateway::announcer::AnnouncementAsset,
};

/// Voice playback that stops advancing for this long is abandoned.
const VOICE_STALL_MS: u64 = 5_000;

// ── Events & options ─────────────────────────────────────────────────────────

/// Signals the engine raises about the track on the active deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    TrackEndingSoon { play_id: u64 },
    /// `capped` is set when the duration cap cut the track short.
    TrackEnded { play_id: u64, capped: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementOutcome {
    Finished,
    Failed,
    Interrupted,
}

#[derive(Debug, Default)]
pub struct AnnouncementOptions {
    /// Duck the music for the narration and release it near the end.
    pub auto_duck: bool,
    /// Fired once, shortly before the narration ends.
    pub near_end: Option<oneshot::Sender<()>>,
}

// ── Engine state ─────────────────────────────────────────────────────────────

struct PlayingTrack {
    play_id: u64,
    track: Track,
    deck: DeckId,
    started_at_ms: u64,
    timing: TrackTiming,
    last_position_ms: u64,
    ending_soon_sent: bool,
    safety_fade_started: bool,
    ended: bool,
}

#[derive(Debug, Clone, Copy)]
enum Ramp {
    Crossfade {
        outgoing: DeckId,
        incoming: DeckId,
        from: f32,
    },
    Duck {
        from: f32,
        to: f32,
    },
    SafetyFade {
        deck: DeckId,
        from: f32,
    },
}

impl Ramp {
    fn kind(&self) -> RampKind {
        match self {
            Ramp::Crossfade { .. } => RampKind::Crossfade,
            Ramp::Duck { .. } => RampKind::Duck,
            Ramp::SafetyFade { .. } => RampKind::SafetyFade,
        }
    }
}

struct RampTask {
    id: u64,
    handle: AbortHandle,
}

struct VoiceJob {
    id: u64,
    done: oneshot::Sender<AnnouncementOutcome>,
    task: Option<AbortHandle>,
}

struct EngineState {
    active: Option<DeckId>,
    /// Deck the next load goes to. Never the audible deck.
    next_target: DeckId,
    current: Option<PlayingTrack>,
    paused: bool,
    /// Fade gain per music deck: [A, B].
    fade: [f32; 2],
    /// Music multiplier applied on top of the fades (1.0 = not ducked).
    duck: f32,
    ramps: HashMap<RampKind, RampTask>,
    voice: Option<VoiceJob>,
    next_play_id: u64,
    next_job_id: u64,
}

impl EngineState {
    fn fade_mut(&mut self, deck: DeckId) -> &mut f32 {
        match deck {
            DeckId::DeckB => &mut self.fade[1],
            _ => &mut self.fade[0],
        }
    }

    fn fade(&self, deck: DeckId) -> f32 {
        match deck {
            DeckId::DeckB => self.fade[1],
            _ => self.fade[0],
        }
    }

    /// Load target, never the deck currently on air.
    fn load_target(&self) -> DeckId {
        match self.active {
            Some(active) if active == self.next_target => active.other(),
            _ => self.next_target,
        }
    }

    fn is_current_ramp(&self, kind: RampKind, id: u64) -> bool {
        self.ramps.get(&kind).map(|r| r.id) == Some(id)
    }
}

struct Shared {
    output: Arc<dyn AudioOutput>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<EngineState>,
    /// Epoch ms of the last observed audio activity.
    heartbeat_ms: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.heartbeat_ms.store(self.clock.now_ms(), Ordering::Release);
    }

    fn apply_gain(&self, st: &EngineState, deck: DeckId) {
        self.output.set_gain(deck, st.fade(deck) * st.duck);
    }
}

// ── DeckEngine ───────────────────────────────────────────────────────────────

/// Dual-deck player with a separate narration channel.
///
/// All deck mutation goes through these methods. Ramps run as tokio tasks,
/// at most one per [`RampKind`]; starting one cancels its predecessor.
#[derive(Clone)]
pub struct DeckEngine {
    shared: Arc<Shared>,
}

impl DeckEngine {
    pub fn new(
        output: Arc<dyn AudioOutput>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        output.set_master_volume(config.master_volume);
        let now = clock.now_ms();
        let engine = Self {
            shared: Arc::new(Shared {
                output,
                config,
                clock,
                events: tx,
                state: Mutex::new(EngineState {
                    active: None,
                    next_target: DeckId::DeckA,
                    current: None,
                    paused: false,
                    fade: [1.0, 1.0],
                    duck: 1.0,
                    ramps: HashMap::new(),
                    voice: None,
                    next_play_id: 1,
                    next_job_id: 1,
                }),
                heartbeat_ms: AtomicU64::new(now),
            }),
        };
        (engine, rx)
    }

    // ── Tracks ────────────────────────────────────────────────────────────

    /// Load `track` on the free deck and bring it on air.
    ///
    /// Returns `false` when the load or start failed; the audible deck is
    /// left untouched and the next call targets the other deck.
    pub fn play_track(&self, track: &Track, crossfade: bool) -> bool {
        let shared = &self.shared;
        let cfg = &shared.config;
        let mut st = shared.lock();
        let target = st.load_target();
        // Start silent; the gain is set once we know whether this is a fade.
        shared.output.set_gain(target, 0.0);

        let loaded = shared
            .output
            .load(target, &track.locator)
            .and_then(|duration| shared.output.play(target).map(|_| duration));
        let reported_duration = match loaded {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Failed to start '{}' on {target}: {e}", track.name);
                shared.output.stop(target);
                st.next_target = target.other();
                return false;
            }
        };

        let now = shared.clock.now_ms();
        let timing = TrackTiming::plan(reported_duration.or(track.duration_ms), track.feature, cfg);

        let outgoing = st.active.filter(|&deck| {
            let snap = shared.output.snapshot(deck);
            snap.state == DeckState::Playing && !snap.finished
        });

        // The old track's safety fade is superseded by whatever happens next.
        abort_ramp(&mut st, RampKind::SafetyFade);

        match outgoing {
            Some(out) if !st.paused => {
                let age = st.current.as_ref().map(|c| now.saturating_sub(c.started_at_ms));
                let window = switch_window_ms(cfg, crossfade, age);
                *st.fade_mut(target) = 0.0;
                shared.apply_gain(&st, target);
                let from = st.fade(out);
                self.start_ramp(
                    &mut st,
                    Ramp::Crossfade {
                        outgoing: out,
                        incoming: target,
                        from,
                    },
                    window,
                );
                log::info!("'{}' on {target}, {window} ms fade from {out}", track.name);
            }
            _ => {
                abort_ramp(&mut st, RampKind::Crossfade);
                if let Some(old) = st.active.filter(|&d| d != target) {
                    shared.output.stop(old);
                    *st.fade_mut(old) = 0.0;
                }
                *st.fade_mut(target) = 1.0;
                shared.apply_gain(&st, target);
                log::info!("'{}' on {target}", track.name);
            }
        }

        let play_id = st.next_play_id;
        st.next_play_id += 1;
        st.active = Some(target);
        st.next_target = target.other();
        st.paused = false;
        st.current = Some(PlayingTrack {
            play_id,
            track: track.clone(),
            deck: target,
            started_at_ms: now,
            timing,
            last_position_ms: 0,
            ending_soon_sent: false,
            safety_fade_started: false,
            ended: false,
        });
        drop(st);
        shared.touch();
        true
    }

    // ── Duck ─────────────────────────────────────────────────────────────

    /// Start ramping the music down to the duck level. Returns `false` when
    /// it is already there and no ramp was needed.
    pub fn duck(&self) -> bool {
        self.ramp_duck_to(self.shared.config.duck_level)
    }

    pub fn unduck(&self) -> bool {
        self.ramp_duck_to(1.0)
    }

    fn ramp_duck_to(&self, to: f32) -> bool {
        let mut st = self.shared.lock();
        let from = st.duck;
        if (from - to).abs() < 1e-4 && !st.ramps.contains_key(&RampKind::Duck) {
            return false;
        }
        let ms = self.shared.config.duck_ramp_ms;
        self.start_ramp(&mut st, Ramp::Duck { from, to }, ms);
        true
    }

    /// Current duck multiplier (1.0 = music at full level).
    pub fn duck_level(&self) -> f32 {
        self.shared.lock().duck
    }

    // ── Announcements ────────────────────────────────────────────────────

    /// Play narration on the voice channel over the music.
    ///
    /// A previous announcement still playing is interrupted. The returned
    /// receiver resolves once with the outcome.
    pub fn play_announcement(
        &self,
        asset: &AnnouncementAsset,
        opts: AnnouncementOptions,
    ) -> oneshot::Receiver<AnnouncementOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        let shared = &self.shared;
        let mut st = shared.lock();

        interrupt_voice(shared, &mut st);

        let started = shared
            .output
            .load(DeckId::Voice, &asset.locator)
            .and_then(|duration| shared.output.play(DeckId::Voice).map(|_| duration));
        let reported = match started {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Announcement {} failed to start: {e}", asset.locator);
                shared.output.stop(DeckId::Voice);
                drop(st);
                if let Some(tx) = opts.near_end {
                    let _ = tx.send(());
                }
                let _ = done_tx.send(AnnouncementOutcome::Failed);
                return done_rx;
            }
        };
        shared.output.set_gain(DeckId::Voice, 1.0);

        let id = st.next_job_id;
        st.next_job_id += 1;
        st.voice = Some(VoiceJob {
            id,
            done: done_tx,
            task: None,
        });
        drop(st);

        if opts.auto_duck {
            self.duck();
        }

        let duration = asset.duration_ms.or(reported);
        let engine = self.clone();
        let task = tokio::spawn(async move {
            engine.watch_voice(id, duration, opts).await;
        });

        let mut st = shared.lock();
        match st.voice.as_mut() {
            Some(job) if job.id == id => job.task = Some(task.abort_handle()),
            _ => task.abort(),
        }
        done_rx
    }

    async fn watch_voice(&self, id: u64, duration: Option<u64>, mut opts: AnnouncementOptions) {
        let cfg = &self.shared.config;
        let mut tick = interval(Duration::from_millis(cfg.monitor_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_pos = 0;
        let mut last_advance = Instant::now();
        let mut near_end_fired = false;

        let outcome = loop {
            tick.tick().await;
            let snap = self.shared.output.snapshot(DeckId::Voice);
            if snap.position_ms > last_pos {
                last_pos = snap.position_ms;
                last_advance = Instant::now();
                self.shared.touch();
            }

            let near_end_at = duration
                .or(snap.duration_ms)
                .map(|d| d.saturating_sub(cfg.announcement_near_end_ms));
            if near_end_at.is_some_and(|at| snap.position_ms >= at) {
                self.signal_near_end(&mut opts, &mut near_end_fired);
            }

            if snap.finished || matches!(snap.state, DeckState::Stopped | DeckState::Idle) {
                break AnnouncementOutcome::Finished;
            }
            if last_advance.elapsed() >= Duration::from_millis(VOICE_STALL_MS) {
                log::warn!("Announcement stalled at {last_pos} ms, abandoning it");
                break AnnouncementOutcome::Failed;
            }
        };

        self.signal_near_end(&mut opts, &mut near_end_fired);
        let mut st = self.shared.lock();
        if st.voice.as_ref().is_some_and(|job| job.id == id) {
            if let Some(job) = st.voice.take() {
                self.shared.output.stop(DeckId::Voice);
                let _ = job.done.send(outcome);
            }
        }
    }

    fn signal_near_end(&self, opts: &mut AnnouncementOptions, fired: &mut bool) {
        if std::mem::replace(fired, true) {
            return;
        }
        if let Some(tx) = opts.near_end.take() {
            let _ = tx.send(());
        }
        if opts.auto_duck {
            self.unduck();
        }
    }

    /// Stop narration in flight, if any.
    pub fn cancel_announcement(&self) {
        let mut st = self.shared.lock();
        interrupt_voice(&self.shared, &mut st);
    }

    // ── Transport ────────────────────────────────────────────────────────

    pub fn set_volume(&self, volume: f32) {
        self.shared.output.set_master_volume(volume.clamp(0.0, 1.0));
    }

    pub fn seek(&self, position_ms: u64) -> bool {
        let mut st = self.shared.lock();
        let Some(cur) = st.current.as_mut() else {
            return false;
        };
        match self.shared.output.seek(cur.deck, position_ms) {
            Ok(()) => {
                cur.last_position_ms = position_ms;
                true
            }
            Err(e) => {
                log::warn!("Seek to {position_ms} ms failed: {e}");
                false
            }
        }
    }

    pub fn pause(&self) {
        let mut st = self.shared.lock();
        for deck in [DeckId::DeckA, DeckId::DeckB] {
            self.shared.output.pause(deck);
        }
        st.paused = true;
    }

    /// Get the active deck audible again. Returns `false` when there is
    /// nothing that could be resumed.
    pub fn resume(&self) -> bool {
        let mut st = self.shared.lock();
        let Some(active) = st.active else {
            return false;
        };
        let snap = self.shared.output.snapshot(active);
        let ok = match snap.state {
            DeckState::Playing => true,
            DeckState::Paused | DeckState::Ready => match self.shared.output.play(active) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Resume on {active} failed: {e}");
                    false
                }
            },
            DeckState::Idle | DeckState::Stopped => false,
        };
        if ok {
            st.paused = false;
            if st.fade(active) < 1e-3 && !st.ramps.contains_key(&RampKind::Crossfade) {
                *st.fade_mut(active) = 1.0;
                self.shared.apply_gain(&st, active);
            }
            drop(st);
            self.shared.touch();
        }
        ok
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Cancel every in-flight ramp and snap levels to rest: duck released,
    /// active deck at full gain, the other deck and the voice channel stopped.
    pub fn settle(&self) {
        let shared = &self.shared;
        let mut st = shared.lock();
        for (_, ramp) in st.ramps.drain() {
            ramp.handle.abort();
        }
        interrupt_voice(shared, &mut st);
        st.duck = 1.0;
        if let Some(active) = st.active {
            let idle = active.other();
            shared.output.stop(idle);
            *st.fade_mut(idle) = 0.0;
            *st.fade_mut(active) = 1.0;
            shared.apply_gain(&st, active);
        }
        if let Some(cur) = st.current.as_mut() {
            cur.safety_fade_started = false;
        }
        log::info!("Engine settled");
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn active_play_id(&self) -> Option<u64> {
        self.shared.lock().current.as_ref().map(|c| c.play_id)
    }

    pub fn now_playing(&self) -> Option<Track> {
        self.shared.lock().current.as_ref().map(|c| c.track.clone())
    }

    pub fn active_deck(&self) -> Option<DeckId> {
        self.shared.lock().active
    }

    pub fn is_playing(&self) -> bool {
        let st = self.shared.lock();
        st.active
            .map(|d| self.shared.output.snapshot(d).state == DeckState::Playing)
            .unwrap_or(false)
    }

    /// Epoch ms of the last audio-activity heartbeat.
    pub fn last_activity_ms(&self) -> u64 {
        self.shared.heartbeat_ms.load(Ordering::Acquire)
    }

    /// Sample the decks on a fixed interval until aborted.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(engine.shared.config.monitor_interval_ms));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.poll();
            }
        })
    }

    /// One monitor pass: heartbeat, ending-soon, safety fade, end of track.
    pub fn poll(&self) {
        let shared = &self.shared;
        let mut st = shared.lock();
        let Some(cur) = st.current.as_mut() else {
            return;
        };
        if cur.ended {
            return;
        }
        let snap = shared.output.snapshot(cur.deck);
        let pos = snap.position_ms;
        let mut advanced = false;
        if pos > cur.last_position_ms {
            cur.last_position_ms = pos;
            advanced = true;
        }

        let play_id = cur.play_id;
        let deck = cur.deck;
        let timing = cur.timing;
        let mut events = Vec::new();

        if !cur.ending_soon_sent && pos >= timing.ending_soon_at_ms {
            cur.ending_soon_sent = true;
            events.push(EngineEvent::TrackEndingSoon { play_id });
        }

        let start_safety = !cur.safety_fade_started
            && timing.safety_fade_at_ms.is_some_and(|at| pos >= at);
        if start_safety {
            cur.safety_fade_started = true;
        }

        let capped = pos >= timing.cap_ms;
        if snap.finished || capped {
            cur.ended = true;
            if !cur.ending_soon_sent {
                cur.ending_soon_sent = true;
                events.push(EngineEvent::TrackEndingSoon { play_id });
            }
            events.push(EngineEvent::TrackEnded {
                play_id,
                capped: capped && !snap.finished,
            });
            if capped {
                log::info!("Track {play_id} reached its {} ms cap", timing.cap_ms);
                abort_ramp(&mut st, RampKind::SafetyFade);
                shared.output.stop(deck);
            }
        } else if start_safety {
            let from = st.fade(deck);
            let ms = timing.cap_ms.saturating_sub(pos).min(shared.config.safety_fade_ms);
            log::info!("Safety fade on {deck} over {ms} ms");
            self.start_ramp(&mut st, Ramp::SafetyFade { deck, from }, ms);
        }
        drop(st);

        if advanced {
            shared.touch();
        }
        for ev in events {
            let _ = shared.events.send(ev);
        }
    }

    // ── Ramps ────────────────────────────────────────────────────────────

    fn start_ramp(&self, st: &mut EngineState, ramp: Ramp, duration_ms: u64) {
        let kind = ramp.kind();
        let id = st.next_job_id;
        st.next_job_id += 1;

        let shared = Arc::clone(&self.shared);
        let step_ms = shared.config.ramp_step_ms;
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut tick = interval(Duration::from_millis(step_ms));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let t = if duration_ms == 0 {
                    1.0
                } else {
                    (started.elapsed().as_millis() as f32 / duration_ms as f32).min(1.0)
                };
                let mut st = shared.lock();
                if !st.is_current_ramp(kind, id) {
                    break;
                }
                step_ramp(&shared, &mut st, ramp, t);
                if t >= 1.0 {
                    st.ramps.remove(&kind);
                    break;
                }
            }
        });

        if let Some(prev) = st.ramps.insert(
            kind,
            RampTask {
                id,
                handle: task.abort_handle(),
            },
        ) {
            prev.handle.abort();
        }
    }
}

fn step_ramp(shared: &Shared, st: &mut EngineState, ramp: Ramp, t: f32) {
    match ramp {
        Ramp::Crossfade {
            outgoing,
            incoming,
            from,
        } => {
            *st.fade_mut(outgoing) = from * fade_out_gain(t);
            *st.fade_mut(incoming) = fade_in_gain(t);
            shared.apply_gain(st, outgoing);
            shared.apply_gain(st, incoming);
            if t >= 1.0 {
                shared.output.stop(outgoing);
            }
        }
        Ramp::Duck { from, to } => {
            st.duck = ramp_level(from, to, t);
            shared.apply_gain(st, DeckId::DeckA);
            shared.apply_gain(st, DeckId::DeckB);
        }
        Ramp::SafetyFade { deck, from } => {
            *st.fade_mut(deck) = ramp_level(from, 0.0, t);
            shared.apply_gain(st, deck);
        }
    }
}

fn abort_ramp(st: &mut EngineState, kind: RampKind) {
    if let Some(ramp) = st.ramps.remove(&kind) {
        ramp.handle.abort();
    }
}

fn interrupt_voice(shared: &Shared, st: &mut EngineState) {
    if let Some(job) = st.voice.take() {
        if let Some(task) = job.task {
            task.abort();
        }
        shared.output.stop(DeckId::Voice);
        let _ = job.done.send(AnnouncementOutcome::Interrupted);
    }
}
