//! Rotation scheduler: the show's state machine.
//!
//! One task owns all rotation state and consumes a single event channel:
//! operator requests, remote commands, engine track signals and watchdog
//! notices. Anything that changes what is on air first takes the
//! [`TransitionLock`].
use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use super::{
    rotation::{
        InterstitialAssignments, Performer, PerformerId, PlaybackPosition, RotationQueue, Roster,
        SchedulerState, SetAssignment, SetAssignments,
    },
    selection::TrackSelector,
    transition::{LockOwner, TransitionGuard, TransitionLock},
};
use crate::{
    audio::{AnnouncementOptions, AnnouncementOutcome, DeckEngine, EngineEvent},
    catalog::Track,
    clock::Clock,
    config::SchedulerConfig,
    db::ShowStore,
    events::{EventBus, PlaybackStatus, ShowEvent},
    gateway::{
        announcer::{AnnouncementGateway, AnnouncementKind, AnnouncementRequest},
        remote::{Command, CommandAction, CommandIntake},
    },
};

// ── Events & handle ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Empty lineup means the configured or restored one.
    Start { lineup: Vec<PerformerId> },
    Stop,
    /// `at_ms` is when the skip was requested.
    Skip { at_ms: u64 },
    SkipDancer { performer_id: PerformerId },
    TrackEndingSoon { play_id: u64 },
    TrackEnded { play_id: u64 },
    Command { command: Command, received_ms: u64 },
    RosterUpdated { performers: Vec<Performer> },
    /// The watchdog put this track on air.
    RecoveryTrack { track: Track },
    Shutdown,
}

impl From<EngineEvent> for SchedulerEvent {
    fn from(ev: EngineEvent) -> Self {
        match ev {
            EngineEvent::TrackEndingSoon { play_id } => SchedulerEvent::TrackEndingSoon { play_id },
            EngineEvent::TrackEnded { play_id, .. } => SchedulerEvent::TrackEnded { play_id },
        }
    }
}

/// Cheap, cloneable front door to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
    status: watch::Receiver<PlaybackStatus>,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    fn send(&self, event: SchedulerEvent) -> bool {
        if self.tx.send(event).is_err() {
            log::debug!("Scheduler is gone; event dropped");
            return false;
        }
        true
    }

    pub fn start(&self, lineup: Vec<PerformerId>) -> bool {
        self.send(SchedulerEvent::Start { lineup })
    }

    pub fn stop(&self) -> bool {
        self.send(SchedulerEvent::Stop)
    }

    pub fn skip(&self) -> bool {
        self.send(SchedulerEvent::Skip {
            at_ms: self.clock.now_ms(),
        })
    }

    pub fn skip_dancer(&self, performer_id: PerformerId) -> bool {
        self.send(SchedulerEvent::SkipDancer { performer_id })
    }

    pub fn submit_command(&self, command: Command, received_ms: u64) -> bool {
        self.send(SchedulerEvent::Command {
            command,
            received_ms,
        })
    }

    pub fn update_roster(&self, performers: Vec<Performer>) -> bool {
        self.send(SchedulerEvent::RosterUpdated { performers })
    }

    pub fn notify_recovery(&self, track: Track) -> bool {
        self.send(SchedulerEvent::RecoveryTrack { track })
    }

    pub fn shutdown(&self) -> bool {
        self.send(SchedulerEvent::Shutdown)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub engine: DeckEngine,
    pub selector: Arc<TrackSelector>,
    pub announcer: Option<Arc<dyn AnnouncementGateway>>,
    pub store: Arc<dyn ShowStore>,
    pub clock: Arc<dyn Clock>,
    pub lock: TransitionLock,
    pub bus: EventBus,
    /// Upstream command acknowledgements.
    pub acks: Option<mpsc::UnboundedSender<u64>>,
}

pub struct RotationScheduler {
    config: SchedulerConfig,
    engine: DeckEngine,
    selector: Arc<TrackSelector>,
    announcer: Option<Arc<dyn AnnouncementGateway>>,
    store: Arc<dyn ShowStore>,
    clock: Arc<dyn Clock>,
    lock: TransitionLock,
    bus: EventBus,

    roster: Roster,
    queue: RotationQueue,
    default_lineup: Vec<PerformerId>,
    position: PlaybackPosition,
    /// Performer whose set is playing; `None` outside a set.
    on_air: Option<PerformerId>,
    sets: SetAssignments,
    breaks: InterstitialAssignments,
    /// Break currently playing, taken from its slot.
    break_tracks: Vec<Track>,
    fallback_playing: bool,
    intake: CommandIntake,
    announcement: Option<JoinHandle<()>>,

    tx: mpsc::UnboundedSender<SchedulerEvent>,
    rx: Option<mpsc::UnboundedReceiver<SchedulerEvent>>,
    status_tx: watch::Sender<PlaybackStatus>,
}

impl RotationScheduler {
    pub fn new(
        config: SchedulerConfig,
        performers: Vec<Performer>,
        lineup: Vec<PerformerId>,
        deps: SchedulerDeps,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(PlaybackStatus::default());
        let handle = SchedulerHandle {
            tx: tx.clone(),
            status: status_rx,
            clock: deps.clock.clone(),
        };
        let scheduler = Self {
            config,
            engine: deps.engine,
            selector: deps.selector,
            announcer: deps.announcer,
            store: deps.store,
            clock: deps.clock,
            lock: deps.lock,
            bus: deps.bus,
            roster: Roster::new(performers),
            queue: RotationQueue::default(),
            default_lineup: lineup,
            position: PlaybackPosition::default(),
            on_air: None,
            sets: SetAssignments::default(),
            breaks: InterstitialAssignments::default(),
            break_tracks: Vec::new(),
            fallback_playing: false,
            intake: CommandIntake::new(deps.acks),
            announcement: None,
            tx,
            rx: Some(rx),
            status_tx,
        };
        (scheduler, handle)
    }

    // ── Observation ───────────────────────────────────────────────────────

    pub fn state(&self) -> SchedulerState {
        self.position.state()
    }

    pub fn position(&self) -> PlaybackPosition {
        self.position
    }

    pub fn queue(&self) -> &[PerformerId] {
        self.queue.ids()
    }

    pub fn on_air(&self) -> Option<PerformerId> {
        self.on_air
    }

    pub fn assignment(&self, id: PerformerId) -> Option<&SetAssignment> {
        self.sets.get(id)
    }

    pub fn has_break_after(&self, id: PerformerId) -> bool {
        self.breaks.has_break_after(id)
    }

    pub fn is_fallback_playing(&self) -> bool {
        self.fallback_playing
    }

    fn songs_per_set(&self, id: PerformerId) -> u32 {
        let default = self.config.songs_per_set.max(1);
        self.roster
            .get(id)
            .map(|p| p.songs_per_set_or(default))
            .unwrap_or(default)
    }

    fn build_status(&self) -> PlaybackStatus {
        let performer_id = self.on_air;
        PlaybackStatus {
            performer_id,
            performer_name: performer_id.map(|id| self.roster.display_name(id)),
            track: self.engine.now_playing().map(|t| t.name),
            song_number: self.position.song_number,
            playing: self.engine.is_playing(),
            paused: self.engine.is_paused(),
            rotation_active: self.position.rotation_active,
            playing_break: self.position.playing_break,
            break_index: self.position.break_index,
            fallback_playing: self.fallback_playing,
            lineup: self.queue.ids().to_vec(),
        }
    }

    fn publish_status(&self) {
        let status = self.build_status();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            self.bus.emit_lossy(ShowEvent::StatusChanged { status });
        }
    }

    // ── Event loop ────────────────────────────────────────────────────────

    pub fn spawn(self, engine_events: mpsc::UnboundedReceiver<EngineEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(engine_events))
    }

    /// Consume events until [`SchedulerEvent::Shutdown`]. Engine signals are
    /// forwarded into the same channel so everything is handled in order.
    pub async fn run(mut self, mut engine_events: mpsc::UnboundedReceiver<EngineEvent>) {
        let Some(mut rx) = self.rx.take() else {
            log::error!("Rotation scheduler already ran");
            return;
        };
        let forward = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(ev) = engine_events.recv().await {
                if forward.send(ev.into()).is_err() {
                    break;
                }
            }
        });

        self.publish_status();
        log::info!("Rotation scheduler running");
        while let Some(event) = rx.recv().await {
            if matches!(event, SchedulerEvent::Shutdown) {
                break;
            }
            self.dispatch(event).await;
        }

        forwarder.abort();
        self.abort_announcement();
        log::info!("Rotation scheduler stopped");
    }

    pub async fn dispatch(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Start { lineup } => {
                self.start(lineup).await;
            }
            SchedulerEvent::Stop => {
                self.stop();
            }
            SchedulerEvent::Skip { at_ms } => self.skip(at_ms).await,
            SchedulerEvent::SkipDancer { performer_id } => {
                self.skip_dancer(performer_id).await;
            }
            SchedulerEvent::TrackEndingSoon { play_id } => self.on_ending_soon(play_id).await,
            SchedulerEvent::TrackEnded { play_id } => self.on_track_ended(play_id).await,
            SchedulerEvent::Command {
                command,
                received_ms,
            } => self.handle_command(command, received_ms).await,
            SchedulerEvent::RosterUpdated { performers } => self.update_roster(performers).await,
            SchedulerEvent::RecoveryTrack { track } => self.on_recovery_track(track),
            SchedulerEvent::Shutdown => {}
        }
        self.publish_status();
    }

    // ── Startup ───────────────────────────────────────────────────────────

    /// Reload cooldowns and the persisted rotation, then optionally start.
    pub async fn restore(&mut self, auto_start: bool) {
        self.selector.load_cooldowns().await;
        self.selector.seed_pool().await;

        match self.store.load_rotation_state().await {
            Ok(Some(snap)) if !snap.order.is_empty() => {
                let mut queue = RotationQueue::from_ids(&snap.order, &self.roster);
                // The saved current performer, or the first survivor after them.
                let head = snap
                    .order
                    .iter()
                    .cycle()
                    .skip(snap.current_index % snap.order.len())
                    .take(snap.order.len())
                    .find(|id| queue.contains(**id))
                    .copied();
                if let Some(head) = head {
                    queue.rotate_to(head);
                }
                log::info!("Restored rotation {:?}", queue.ids());
                self.default_lineup = queue.ids().to_vec();
                self.queue = queue;
            }
            Ok(_) => {
                self.queue = RotationQueue::from_ids(&self.default_lineup, &self.roster);
                log::info!("No saved rotation; lineup {:?}", self.queue.ids());
            }
            Err(e) => log::warn!("Could not load rotation state: {e}"),
        }

        if auto_start {
            self.start(Vec::new()).await;
        }
        self.publish_status();
    }

    // ── Transitions ───────────────────────────────────────────────────────

    async fn start(&mut self, lineup: Vec<PerformerId>) -> bool {
        if self.position.rotation_active {
            log::warn!("Rotation already running; start ignored");
            return false;
        }
        let requested = if lineup.is_empty() {
            self.default_lineup.clone()
        } else {
            lineup
        };
        let queue = RotationQueue::from_ids(&requested, &self.roster);
        let Some(first_id) = queue.current() else {
            log::warn!("Cannot start rotation: no active performers in {requested:?}");
            return false;
        };
        let Some(guard) = self.lock.try_acquire(LockOwner::Transition) else {
            log::warn!("Cannot start rotation: a transition or recovery is in flight");
            return false;
        };

        self.queue = queue;
        self.sets.clear();
        for id in self.queue.ids().to_vec() {
            self.ensure_set(id).await;
            if guard.is_cancelled() {
                log::warn!("Rotation start cancelled");
                return false;
            }
        }
        let Some(first) = self.sets.track_for(first_id, 1) else {
            log::warn!("Cannot start rotation: the catalog has no playable tracks");
            self.sets.clear();
            return false;
        };
        if self.config.auto_break_songs > 0 {
            for id in self.queue.ids().to_vec() {
                self.fill_auto_break(id).await;
            }
        }

        self.fallback_playing = false;
        self.default_lineup = self.queue.ids().to_vec();
        self.position.enter_set(0);
        self.on_air = Some(first_id);
        log::info!(
            "Rotation started with {} ({} performers)",
            self.roster.display_name(first_id),
            self.queue.len()
        );

        self.play_with_fallback(Some(first), Some(first_id), false).await;
        self.persist_rotation().await;
        let intro = self.request(AnnouncementKind::Intro, first_id, None, 1);
        self.spawn_announcement(intro);
        drop(guard);
        true
    }

    /// Move past the current track: next song, next performer, or next break
    /// track, depending on where the show is.
    async fn advance(&mut self, guard: &TransitionGuard) {
        match self.position.state() {
            SchedulerState::Idle => {}
            SchedulerState::PlayingSet { song_number, .. } => {
                let Some(id) = self.on_air else {
                    log::warn!("In a set with nobody on air; moving to the next performer");
                    self.leave_break(guard).await;
                    return;
                };
                if song_number < self.songs_per_set(id) && self.roster.is_active(id) {
                    self.next_song(id, song_number + 1, guard).await;
                } else {
                    self.finish_set(id, guard).await;
                }
            }
            SchedulerState::PlayingBreak { break_index, .. } => {
                let next = break_index + 1;
                match self.break_tracks.get(next).cloned() {
                    Some(track) => {
                        self.position.break_index = next;
                        log::info!("Break track {} of {}", next + 1, self.break_tracks.len());
                        self.play_with_fallback(Some(track), None, true).await;
                    }
                    None => self.leave_break(guard).await,
                }
            }
        }
    }

    async fn next_song(&mut self, id: PerformerId, song_number: u32, guard: &TransitionGuard) {
        self.ensure_set(id).await;
        let track = self.sets.track_for(id, song_number);
        let round = self.request(AnnouncementKind::Round, id, None, song_number);
        self.announce_then_wait(round, guard).await;
        if guard.is_cancelled() {
            log::warn!("Transition to song {song_number} cancelled");
            return;
        }
        self.position.song_number = song_number;
        self.play_with_fallback(track, Some(id), false).await;
    }

    async fn finish_set(&mut self, outgoing: PerformerId, guard: &TransitionGuard) {
        if self.queue.current() == Some(outgoing) {
            self.queue.rotate_to_back();
        }
        self.sets.remove(outgoing);
        let Some(incoming) = self.queue.current() else {
            log::warn!("No performers left in the rotation; stopping");
            self.stop();
            return;
        };

        if self.breaks.has_break_after(outgoing) {
            self.break_tracks = self.breaks.take(outgoing);
            self.on_air = None;
            self.position.enter_break(0);
            log::info!(
                "{} finished; {} break tracks before {}",
                self.roster.display_name(outgoing),
                self.break_tracks.len(),
                self.roster.display_name(incoming)
            );
            self.persist_rotation().await;
            let outro = self.request(AnnouncementKind::Outro, outgoing, Some(incoming), 1);
            self.spawn_announcement(outro);
            let first = self.break_tracks.first().cloned();
            self.play_with_fallback(first, None, true).await;
            return;
        }

        self.ensure_set(incoming).await;
        self.on_air = Some(incoming);
        self.position.enter_set(0);
        log::info!(
            "Handover {} -> {}",
            self.roster.display_name(outgoing),
            self.roster.display_name(incoming)
        );
        let handover = self.request(AnnouncementKind::Transition, outgoing, Some(incoming), 1);
        self.announce_then_wait(handover, guard).await;
        if guard.is_cancelled() {
            log::warn!("Handover to {incoming} cancelled");
            self.persist_rotation().await;
            return;
        }
        let first = self.sets.track_for(incoming, 1);
        self.play_with_fallback(first, Some(incoming), false).await;
        self.persist_rotation().await;
    }

    /// End of a break (or of an orphaned set): the head of the queue starts
    /// with a crossfade and no announcement.
    async fn leave_break(&mut self, guard: &TransitionGuard) {
        self.break_tracks.clear();
        let Some(incoming) = self.queue.current() else {
            log::warn!("No performers left in the rotation; stopping");
            self.stop();
            return;
        };
        self.ensure_set(incoming).await;
        if guard.is_cancelled() {
            return;
        }
        self.on_air = Some(incoming);
        self.position.enter_set(0);
        let first = self.sets.track_for(incoming, 1);
        self.play_with_fallback(first, Some(incoming), true).await;
        self.persist_rotation().await;
    }

    fn stop(&mut self) -> bool {
        if !self.position.rotation_active {
            log::warn!("Stop ignored: rotation is not running");
            return false;
        }
        self.abort_announcement();
        self.engine.cancel_announcement();
        self.engine.unduck();
        self.sets.clear();
        self.break_tracks.clear();
        self.on_air = None;
        self.position.reset();
        self.default_lineup = self.queue.ids().to_vec();
        self.fallback_playing = self.config.house_music && self.engine.now_playing().is_some();
        log::info!(
            "Rotation stopped{}",
            if self.fallback_playing { "; house music continues" } else { "" }
        );
        true
    }

    async fn skip_dancer(&mut self, id: PerformerId) -> bool {
        if self.queue.len() <= 1 {
            log::info!("Skip of performer {id} ignored: rotation has a single entry");
            return false;
        }
        if self.position.rotation_active && self.on_air == Some(id) {
            log::warn!("Cannot skip {}: they are on stage", self.roster.display_name(id));
            return false;
        }
        if !self.queue.move_to_back(id) {
            log::warn!("Cannot skip performer {id}: not in the rotation");
            return false;
        }
        log::info!("{} moved to the back", self.roster.display_name(id));
        self.persist_rotation().await;
        true
    }

    // ── Triggers ──────────────────────────────────────────────────────────

    async fn skip(&mut self, at_ms: u64) {
        if self.lock.within_transition_window(at_ms) {
            log::info!("Skip requested at {at_ms} dropped: inside a transition");
            return;
        }
        self.on_trigger().await;
    }

    async fn on_track_ended(&mut self, play_id: u64) {
        if self.engine.active_play_id() != Some(play_id) {
            log::debug!("Ignoring end of stale play {play_id}");
            return;
        }
        self.on_trigger().await;
    }

    async fn on_trigger(&mut self) {
        let filling_house = !self.position.rotation_active
            && self.config.house_music
            && self.engine.now_playing().is_some();
        if !self.position.rotation_active && !filling_house {
            return;
        }
        let Some(guard) = self.lock.try_acquire(LockOwner::Transition) else {
            log::debug!("Trigger dropped: a transition or recovery is in flight");
            return;
        };
        if self.position.rotation_active {
            self.advance(&guard).await;
        } else if self.play_with_fallback(None, None, true).await {
            self.fallback_playing = true;
        }
    }

    /// Warm caches for whatever comes next.
    async fn on_ending_soon(&mut self, play_id: u64) {
        if self.engine.active_play_id() != Some(play_id) || !self.position.rotation_active {
            return;
        }
        match self.position.state() {
            SchedulerState::PlayingSet { song_number, .. } => {
                let Some(id) = self.on_air else {
                    return;
                };
                if song_number < self.songs_per_set(id) {
                    self.ensure_set(id).await;
                    let round = self.request(AnnouncementKind::Round, id, None, song_number + 1);
                    self.warm_announcement(round);
                    return;
                }
                if self.config.auto_break_songs > 0 && !self.breaks.has_break_after(id) {
                    self.fill_auto_break(id).await;
                }
                let incoming = if self.queue.current() == Some(id) {
                    self.queue.next_after(0)
                } else {
                    self.queue.current()
                };
                let Some(incoming) = incoming else {
                    return;
                };
                if incoming != id {
                    self.ensure_set(incoming).await;
                }
                let kind = if self.breaks.has_break_after(id) {
                    AnnouncementKind::Outro
                } else {
                    AnnouncementKind::Transition
                };
                let next = self.request(kind, id, Some(incoming), 1);
                self.warm_announcement(next);
            }
            SchedulerState::PlayingBreak { break_index, .. } => {
                if break_index + 1 >= self.break_tracks.len() {
                    if let Some(incoming) = self.queue.current() {
                        self.ensure_set(incoming).await;
                    }
                }
            }
            SchedulerState::Idle => {}
        }
    }

    fn on_recovery_track(&mut self, track: Track) {
        if !self.position.rotation_active {
            self.fallback_playing = true;
        }
        log::info!("Watchdog recovered playback with '{}'", track.name);
    }

    // ── Commands ──────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command, received_ms: u64) {
        if !self.intake.admit(&command) {
            log::debug!("Command {} already processed", command.id);
            let upto = self.intake.last_processed();
            self.intake.ack_commands(upto);
            return;
        }
        log::info!("Command {}: {:?}", command.id, command.action);

        match command.action {
            CommandAction::Skip => self.skip(received_ms).await,
            CommandAction::Pause => self.engine.pause(),
            CommandAction::Resume => {
                self.engine.resume();
            }
            CommandAction::TogglePause => {
                if self.engine.is_paused() {
                    self.engine.resume();
                } else {
                    self.engine.pause();
                }
            }
            CommandAction::SetVolume { volume } => self.engine.set_volume(volume),
            CommandAction::Seek { position_ms } => {
                self.engine.seek(position_ms);
            }
            CommandAction::StartRotation { lineup } => {
                self.start(lineup).await;
            }
            CommandAction::StopRotation => {
                self.stop();
            }
            CommandAction::SkipDancer { performer_id } => {
                self.skip_dancer(performer_id).await;
            }
            CommandAction::SetBreakSongs { after, names } => {
                self.set_break_songs(after, &names).await;
            }
            CommandAction::UpdateRoster { performers } => self.update_roster(performers).await,
        }

        self.intake.mark_processed(command.id);
        self.intake.ack_commands(command.id);
        self.bus
            .emit_lossy(ShowEvent::CommandProcessed { id: command.id });
    }

    async fn set_break_songs(&mut self, after: PerformerId, names: &[String]) {
        let mut tracks = Vec::with_capacity(names.len());
        for name in names {
            match self.selector.resolve_by_name(name).await {
                Some(track) => tracks.push(track),
                None => log::warn!("Break song '{name}' not found in the catalog"),
            }
        }
        log::info!(
            "{} break tracks after {}",
            tracks.len(),
            self.roster.display_name(after)
        );
        self.breaks.set(after, tracks);
    }

    async fn update_roster(&mut self, performers: Vec<Performer>) {
        self.roster.replace(performers);
        let removed = self.queue.purge(&self.roster);
        let roster = &self.roster;
        self.sets.retain_ids(|id| roster.is_active(id));
        self.breaks.retain_ids(|id| roster.is_active(id));
        self.default_lineup.retain(|id| roster.is_active(*id));
        log::info!("Roster updated: {} performers", self.roster.len());

        if !removed.is_empty() {
            log::info!("Removed {removed:?} from the rotation");
            self.persist_rotation().await;
        }
        if !self.position.rotation_active {
            return;
        }
        if self.queue.is_empty() {
            log::warn!("Roster left no active performers; stopping rotation");
            self.stop();
            return;
        }
        if let Some(id) = self.on_air {
            let limit = self.songs_per_set(id);
            self.position.song_number = self.position.song_number.min(limit);
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Resolve `id`'s set unless one is already assigned.
    async fn ensure_set(&mut self, id: PerformerId) {
        if self.sets.contains(id) {
            return;
        }
        let Some(performer) = self.roster.get(id).cloned() else {
            return;
        };
        let songs = self.songs_per_set(id);
        let assigned = self.sets.assigned_names_except(id);
        let set = self
            .selector
            .select_for_performer(&performer, songs, &assigned)
            .await;
        log::debug!(
            "Set for {}: {:?}",
            performer.name,
            set.tracks.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
        );
        self.sets.insert(id, set);
    }

    async fn fill_auto_break(&mut self, after: PerformerId) {
        let batch = self
            .selector
            .random_fallback(
                self.config.auto_break_songs,
                &self.now_playing_key(),
                &self.sets.assigned_names(),
            )
            .await;
        let batch: Vec<Track> = batch.into_iter().take(self.config.auto_break_songs).collect();
        self.breaks.set(after, batch);
    }

    /// Escalation: primary, then spares from the same batch, then a random
    /// batch, then whatever `resume()` can revive.
    async fn play_with_fallback(
        &mut self,
        primary: Option<Track>,
        performer: Option<PerformerId>,
        crossfade: bool,
    ) -> bool {
        let mut candidates: Vec<Track> = primary.into_iter().collect();
        if let Some(id) = performer {
            candidates.extend(self.sets.spares(id));
        }
        // A set picked earlier may hold a track that has since been played
        // (by the watchdog, a house fill or a spare elsewhere).
        let (fresh, cooling): (Vec<Track>, Vec<Track>) = candidates
            .into_iter()
            .partition(|t| !self.selector.is_cooling(&t.name));
        if !cooling.is_empty() && !fresh.is_empty() {
            log::info!("Deferring {} recently played candidates", cooling.len());
        }
        let candidates: Vec<Track> = fresh.into_iter().chain(cooling).collect();

        let mut tried = Vec::new();
        for track in &candidates {
            if self.engine.play_track(track, crossfade) {
                if let Some(id) = performer {
                    self.sets.consume_spare(id, &track.name);
                }
                self.on_track_started(track, performer).await;
                return true;
            }
            tried.push(track.key.clone());
        }
        if !tried.is_empty() {
            log::warn!("{} candidates failed to load; trying a random batch", tried.len());
        }

        let failed = tried.len();
        tried.extend(self.now_playing_key());
        let batch = self
            .selector
            .random_fallback(self.config.fallback_batch, &tried, &self.sets.assigned_names())
            .await;
        for track in &batch {
            if self.engine.play_track(track, crossfade) {
                self.on_track_started(track, performer).await;
                return true;
            }
        }

        log::warn!(
            "Nothing playable after {} attempts; resuming current audio",
            failed + batch.len()
        );
        self.engine.resume();
        false
    }

    fn now_playing_key(&self) -> Vec<String> {
        self.engine.now_playing().map(|t| t.key).into_iter().collect()
    }

    async fn on_track_started(&self, track: &Track, performer: Option<PerformerId>) {
        self.selector.stamp(&track.name).await;
        self.bus.emit_lossy(ShowEvent::TrackStarted {
            track: track.name.clone(),
            performer_id: performer,
            at_ms: self.clock.now_ms(),
        });
    }

    async fn persist_rotation(&self) {
        let order = self.queue.ids();
        if let Err(e) = self
            .store
            .save_rotation_state(order, self.position.performer_index)
            .await
        {
            log::warn!("Could not persist rotation state: {e}");
        }
        self.bus.emit_lossy(ShowEvent::RotationChanged {
            order: order.to_vec(),
        });
    }

    fn request(
        &self,
        kind: AnnouncementKind,
        performer: PerformerId,
        next: Option<PerformerId>,
        round: u32,
    ) -> AnnouncementRequest {
        AnnouncementRequest {
            kind,
            performer: self.roster.display_name(performer),
            next_performer: next.map(|id| self.roster.display_name(id)),
            round,
            energy_level: self.config.energy_level,
        }
    }

    fn abort_announcement(&mut self) {
        if let Some(task) = self.announcement.take() {
            task.abort();
        }
    }

    /// Start narration in the background (duck, narrate, unduck). Returns
    /// the near-end signal, or `None` when announcements are off.
    fn spawn_announcement(&mut self, request: AnnouncementRequest) -> Option<oneshot::Receiver<()>> {
        if !self.config.announcements_enabled {
            return None;
        }
        let announcer = self.announcer.clone()?;
        self.abort_announcement();

        let (near_tx, near_rx) = oneshot::channel();
        let engine = self.engine.clone();
        let bus = self.bus.clone();
        let clock = self.clock.clone();
        let timeout = Duration::from_millis(self.config.announcement_timeout_ms);
        let task = tokio::spawn(async move {
            let kind = request.kind;
            let asset = match tokio::time::timeout(timeout, announcer.announcement_asset(&request)).await {
                Ok(Ok(asset)) => asset,
                Ok(Err(e)) => {
                    log::warn!("{kind} announcement skipped: {e}");
                    bus.emit_lossy(ShowEvent::AnnouncementSkipped {
                        kind,
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(_) => {
                    log::warn!("{kind} announcement timed out after {timeout:?}");
                    bus.emit_lossy(ShowEvent::AnnouncementSkipped {
                        kind,
                        reason: "timeout".into(),
                    });
                    return;
                }
            };
            let done = engine.play_announcement(
                &asset,
                AnnouncementOptions {
                    auto_duck: true,
                    near_end: Some(near_tx),
                },
            );
            bus.emit_lossy(ShowEvent::AnnouncementPlayed {
                kind,
                at_ms: clock.now_ms(),
            });
            match done.await {
                Ok(AnnouncementOutcome::Finished) => log::debug!("{kind} announcement finished"),
                Ok(outcome) => log::info!("{kind} announcement ended early: {outcome:?}"),
                Err(_) => {}
            }
        });
        self.announcement = Some(task);
        Some(near_rx)
    }

    /// Narrate, then hold until shortly before the narration ends, bounded by
    /// the overlap delay.
    async fn announce_then_wait(&mut self, request: AnnouncementRequest, guard: &TransitionGuard) {
        let Some(near_end) = self.spawn_announcement(request) else {
            return;
        };
        let overlap = Duration::from_millis(self.config.announcement_overlap_ms);
        tokio::select! {
            _ = guard.cancelled() => {}
            _ = tokio::time::timeout(overlap, near_end) => {}
        }
    }

    /// Fetch an asset ahead of time so the gateway cache is warm.
    fn warm_announcement(&self, request: AnnouncementRequest) {
        if !self.config.announcements_enabled {
            return;
        }
        let Some(announcer) = self.announcer.clone() else {
            return;
        };
        let timeout = Duration::from_millis(self.config.announcement_timeout_ms);
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, announcer.announcement_asset(&request)).await {
                Ok(Ok(_)) => log::debug!("Pre-fetched {} announcement", request.kind),
                Ok(Err(e)) => log::debug!("Pre-fetch of {} announcement failed: {e}", request.kind),
                Err(_) => log::debug!("Pre-fetch of {} announcement timed out", request.kind),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{deck::DeckState, DeckId},
        testing::ShowRig,
    };

    fn sched_config(songs_per_set: u32) -> SchedulerConfig {
        SchedulerConfig {
            songs_per_set,
            ..SchedulerConfig::default()
        }
    }

    async fn settle_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_enters_first_set_with_a_loaded_deck() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;

        assert_eq!(
            rig.sched.state(),
            SchedulerState::PlayingSet {
                performer_index: 0,
                song_number: 1
            }
        );
        assert_eq!(rig.output.state(DeckId::DeckA), DeckState::Playing);
        assert_eq!(rig.sched.on_air(), Some(1));
        let status = rig.handle.status();
        assert!(status.rotation_active);
        assert_eq!(status.performer_name.as_deref(), Some("Ava"));

        settle_ms(100).await;
        let requests = rig.announcer.requests();
        assert_eq!(requests[0].kind, AnnouncementKind::Intro);
        assert_eq!(requests[0].performer, "Ava");
    }

    #[tokio::test(start_paused = true)]
    async fn sets_do_not_share_tracks() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2, 3] })
            .await;
        let names = |id| -> Vec<String> {
            rig.sched.assignment(id).unwrap().tracks.iter().map(|t| t.name.clone()).collect()
        };
        let (a, b, c) = (names(1), names(2), names(3));
        assert_eq!((a.len(), b.len(), c.len()), (3, 3, 1), "Cleo plays one song per set");
        assert!(b.iter().chain(&c).all(|n| !a.contains(n)));
        assert!(c.iter().all(|n| !b.contains(n)));
    }

    #[tokio::test(start_paused = true)]
    async fn start_requires_performers_and_tracks() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![42] })
            .await;
        assert_eq!(rig.sched.state(), SchedulerState::Idle);

        let mut empty = ShowRig::with_catalog(sched_config(3), vec![]);
        empty
            .sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        assert_eq!(empty.sched.state(), SchedulerState::Idle);
        assert!(!empty.lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn catalog_outage_starts_from_the_local_pool() {
        let mut rig = ShowRig::new(sched_config(2));
        rig.sched.restore(false).await;
        rig.catalog.set_failing(true);
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        assert!(rig.handle.status().rotation_active);
        assert!(rig.sched.assignment(1).unwrap().tracks.len() >= 2);
        assert!(rig.sched.assignment(2).unwrap().tracks.len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn two_performers_without_break() {
        let mut rig = ShowRig::new(sched_config(2));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;

        rig.end_current().await;
        assert_eq!(
            rig.sched.state(),
            SchedulerState::PlayingSet {
                performer_index: 0,
                song_number: 2
            }
        );
        let last = rig.announcer.requests().pop().unwrap();
        assert_eq!((last.kind, last.round), (AnnouncementKind::Round, 2));

        rig.end_current().await;
        assert_eq!(rig.sched.queue(), &[2, 1]);
        assert_eq!(
            rig.sched.state(),
            SchedulerState::PlayingSet {
                performer_index: 0,
                song_number: 1
            }
        );
        assert_eq!(rig.sched.on_air(), Some(2));
        let last = rig.announcer.requests().pop().unwrap();
        assert_eq!(last.kind, AnnouncementKind::Transition);
        assert_eq!(last.performer, "Ava");
        assert_eq!(last.next_performer.as_deref(), Some("Bea"));
        assert_eq!(rig.store.rotation().map(|s| s.order), Some(vec![2, 1]));
        assert!(rig.sched.assignment(1).is_none(), "outgoing set is discarded");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_handover_still_saves_the_rotation() {
        let config = SchedulerConfig {
            songs_per_set: 1,
            stale_transition_ms: 1_000,
            announcement_overlap_ms: 60_000,
            ..SchedulerConfig::default()
        };
        let mut rig = ShowRig::new(config);
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        assert_eq!(rig.store.rotation().map(|s| s.order), Some(vec![1, 2]));
        let before = rig.engine.active_play_id();

        // Force-clear the handover while it waits on the narration.
        let lock = rig.lock.clone();
        let breaker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_000)).await;
            lock.try_acquire(LockOwner::Recovery).map(|g| g.was_forced())
        });
        rig.end_current().await;

        assert_eq!(breaker.await.unwrap(), Some(true));
        assert_eq!(rig.engine.active_play_id(), before, "cancelled handover plays nothing");
        assert_eq!(rig.sched.queue(), &[2, 1]);
        assert_eq!(rig.store.rotation().map(|s| s.order), Some(vec![2, 1]));
    }

    #[tokio::test(start_paused = true)]
    async fn break_between_performers() {
        let mut rig = ShowRig::new(sched_config(2));
        rig.command(
            1,
            CommandAction::SetBreakSongs {
                after: 1,
                names: vec!["song-29".into()],
            },
        )
        .await;
        assert!(rig.sched.has_break_after(1));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        rig.end_current().await;
        rig.end_current().await;

        assert_eq!(rig.sched.queue(), &[2, 1]);
        assert_eq!(
            rig.sched.state(),
            SchedulerState::PlayingBreak {
                performer_index: 0,
                break_index: 0
            }
        );
        assert_eq!(rig.engine.now_playing().map(|t| t.name), Some("song-29".into()));
        settle_ms(100).await;
        let last = rig.announcer.requests().pop().unwrap();
        assert_eq!(last.kind, AnnouncementKind::Outro);
        assert_eq!(last.next_performer.as_deref(), Some("Bea"));
        let announced = rig.announcer.requests().len();

        rig.end_current().await;
        settle_ms(100).await;
        assert_eq!(
            rig.sched.state(),
            SchedulerState::PlayingSet {
                performer_index: 0,
                song_number: 1
            }
        );
        assert_eq!(rig.sched.on_air(), Some(2));
        assert_eq!(rig.announcer.requests().len(), announced, "no second announcement");
        assert!(!rig.sched.has_break_after(1), "break slot is consumed");
    }

    #[tokio::test(start_paused = true)]
    async fn five_load_failures_end_in_resume() {
        let config = SchedulerConfig {
            songs_per_set: 3,
            spare_tracks: 2,
            fallback_batch: 2,
            ..SchedulerConfig::default()
        };
        let mut rig = ShowRig::new(config);
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        let before = rig.engine.active_play_id();
        let loads_before = rig.output.loads().len();

        rig.output.fail_next_loads(5);
        rig.end_current().await;

        assert_eq!(rig.output.loads().len() - loads_before, 5);
        assert_eq!(rig.engine.active_play_id(), before);
        assert_eq!(rig.output.state(DeckId::DeckA), DeckState::Playing);
        assert_eq!(
            rig.sched.state(),
            SchedulerState::PlayingSet {
                performer_index: 0,
                song_number: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_primary_falls_back_to_a_spare() {
        let mut rig = ShowRig::new(sched_config(2));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1] })
            .await;
        let spare = rig.sched.assignment(1).unwrap().spares[0].name.clone();
        rig.output.fail_next_loads(1);
        rig.end_current().await;
        assert_eq!(rig.engine.now_playing().map(|t| t.name), Some(spare.clone()));
        assert!(rig.sched.assignment(1).unwrap().spares.iter().all(|t| t.name != spare));
    }

    #[tokio::test(start_paused = true)]
    async fn spare_played_after_a_failed_load_is_not_replayed_by_the_next_set() {
        let config = SchedulerConfig {
            songs_per_set: 2,
            spare_tracks: 2,
            ..SchedulerConfig::default()
        };
        let mut rig = ShowRig::new(config);
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        let names = |set: &SetAssignment| -> Vec<String> {
            set.tracks.iter().chain(&set.spares).map(|t| t.name.clone()).collect()
        };
        let a = names(rig.sched.assignment(1).unwrap());
        let b = names(rig.sched.assignment(2).unwrap());
        assert!(b.iter().all(|n| !a.contains(n)), "spares are shared: {a:?} / {b:?}");

        rig.output.fail_next_loads(1);
        rig.end_current().await;
        let spare = rig.engine.now_playing().unwrap().name;
        assert!(a.contains(&spare));

        rig.end_current().await;
        assert_eq!(rig.sched.on_air(), Some(2));
        let on_air = rig.engine.now_playing().unwrap().name;
        assert_ne!(on_air, spare);
        assert!(b.contains(&on_air));
    }

    #[tokio::test(start_paused = true)]
    async fn set_track_played_elsewhere_is_deferred_to_a_spare() {
        let config = SchedulerConfig {
            songs_per_set: 2,
            spare_tracks: 2,
            ..SchedulerConfig::default()
        };
        let mut rig = ShowRig::new(config);
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        let set = rig.sched.assignment(2).unwrap().clone();
        let first = set.tracks[0].name.clone();
        rig.selector.stamp(&first).await;

        rig.end_current().await;
        rig.end_current().await;
        assert_eq!(rig.sched.on_air(), Some(2));
        let on_air = rig.engine.now_playing().unwrap().name;
        assert_ne!(on_air, first);
        assert!(set.spares.iter().any(|t| t.name == on_air));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_dancer_rules() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2, 3] })
            .await;

        rig.sched.dispatch(SchedulerEvent::SkipDancer { performer_id: 1 }).await;
        assert_eq!(rig.sched.queue(), &[1, 2, 3], "current performer is not skippable");

        rig.sched.dispatch(SchedulerEvent::SkipDancer { performer_id: 2 }).await;
        assert_eq!(rig.sched.queue(), &[1, 3, 2]);
        assert_eq!(rig.sched.on_air(), Some(1), "playback is unaffected");

        let mut solo = ShowRig::new(sched_config(3));
        solo.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![2] })
            .await;
        solo.sched.dispatch(SchedulerEvent::SkipDancer { performer_id: 2 }).await;
        assert_eq!(solo.sched.queue(), &[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn song_number_never_exceeds_set_length() {
        let mut rig = ShowRig::new(sched_config(2));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2, 3] })
            .await;
        for _ in 0..8 {
            rig.end_current().await;
            let status = rig.handle.status();
            let limit = match status.performer_id {
                Some(3) => 1,
                _ => 2,
            };
            assert!(
                status.song_number <= limit,
                "song {} of {limit} for {:?}",
                status.song_number,
                status.performer_id
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn skip_inside_transition_window_is_dropped() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        let started = rig.engine.active_play_id();

        let at_ms = rig.clock.now_ms();
        rig.sched.dispatch(SchedulerEvent::Skip { at_ms }).await;
        assert_eq!(rig.engine.active_play_id(), started);

        settle_ms(1_000).await;
        let at_ms = rig.clock.now_ms();
        rig.sched.dispatch(SchedulerEvent::Skip { at_ms }).await;
        assert_ne!(rig.engine.active_play_id(), started);
        assert_eq!(rig.sched.position().song_number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_holder_suppresses_transitions() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        let guard = rig.lock.try_acquire(LockOwner::Recovery).unwrap();
        rig.end_current().await;
        assert_eq!(rig.sched.position().song_number, 1);
        drop(guard);
        rig.end_current().await;
        assert_eq!(rig.sched.position().song_number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_track_end_is_ignored() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        let old = rig.engine.active_play_id().unwrap();
        rig.end_current().await;
        rig.sched.dispatch(SchedulerEvent::TrackEnded { play_id: old }).await;
        assert_eq!(rig.sched.position().song_number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resets_and_house_music_fills() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        rig.end_current().await;
        rig.sched.dispatch(SchedulerEvent::Stop).await;

        assert_eq!(rig.sched.state(), SchedulerState::Idle);
        assert_eq!(rig.sched.position(), PlaybackPosition::default());
        assert!(rig.sched.assignment(1).is_none());
        assert!(rig.engine.is_playing(), "current track keeps playing");
        settle_ms(5_000).await;
        assert!((rig.engine.duck_level() - 1.0).abs() < 1e-6, "duck released");

        let before = rig.engine.active_play_id();
        rig.end_current().await;
        assert_ne!(rig.engine.active_play_id(), before);
        assert!(rig.sched.is_fallback_playing());
        assert!(rig.handle.status().fallback_playing);
        assert_eq!(rig.sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn house_music_does_not_repeat_recent_tracks() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        rig.sched.dispatch(SchedulerEvent::Stop).await;
        settle_ms(5_000).await;

        let mut played = vec![rig.engine.now_playing().unwrap().name];
        for _ in 0..4 {
            rig.end_current().await;
            played.push(rig.engine.now_playing().unwrap().name);
        }
        assert!(rig.sched.is_fallback_playing());
        let mut distinct = played.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), played.len(), "house music repeated: {played:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_is_a_no_op() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched.dispatch(SchedulerEvent::Stop).await;
        assert_eq!(rig.sched.state(), SchedulerState::Idle);
        assert!(!rig.sched.is_fallback_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_command_is_processed_once() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2] })
            .await;
        settle_ms(1_000).await;

        rig.command(5, CommandAction::Skip).await;
        assert_eq!(rig.sched.position().song_number, 2);
        rig.command(5, CommandAction::Skip).await;
        assert_eq!(rig.sched.position().song_number, 2, "re-delivery is ignored");

        assert_eq!(rig.acks.try_recv().ok(), Some(5));
        assert!(rig.acks.try_recv().is_err(), "re-ack is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_commands_reach_the_engine() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1] })
            .await;
        rig.command(1, CommandAction::TogglePause).await;
        assert!(rig.engine.is_paused());
        assert!(rig.handle.status().paused);
        rig.command(2, CommandAction::Resume).await;
        assert!(!rig.engine.is_paused());
        rig.command(3, CommandAction::SetVolume { volume: 1.7 }).await;
        assert!((rig.output.master_volume() - 1.0).abs() < 1e-6, "volume is clamped");
        rig.command(4, CommandAction::StopRotation).await;
        assert_eq!(rig.sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn announcement_failure_does_not_block() {
        let mut rig = ShowRig::new(sched_config(3));
        let mut events = rig.bus.subscribe();
        rig.announcer.set_failing(true);
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1] })
            .await;
        settle_ms(100).await;
        rig.end_current().await;
        assert_eq!(rig.sched.position().song_number, 2);

        settle_ms(100).await;
        let mut skipped = 0;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, ShowEvent::AnnouncementSkipped { .. }) {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 2, "intro and round were both skipped");
    }

    #[tokio::test(start_paused = true)]
    async fn roster_update_purges_the_queue() {
        let mut rig = ShowRig::new(sched_config(2));
        rig.sched
            .dispatch(SchedulerEvent::Start { lineup: vec![1, 2, 3] })
            .await;
        let mut roster = ShowRig::performers();
        roster.retain(|p| p.id != 2);
        rig.sched
            .dispatch(SchedulerEvent::RosterUpdated { performers: roster })
            .await;
        assert_eq!(rig.sched.queue(), &[1, 3]);
        assert!(rig.sched.assignment(2).is_none());

        rig.sched
            .dispatch(SchedulerEvent::RosterUpdated { performers: vec![] })
            .await;
        assert_eq!(rig.sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_rotates_to_saved_current() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.store.seed_rotation(vec![1, 2, 3], 1);
        rig.sched.restore(true).await;
        assert_eq!(rig.sched.queue(), &[2, 3, 1]);
        assert_eq!(rig.sched.on_air(), Some(2));
        assert!(rig.handle.status().rotation_active);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_skips_purged_current() {
        let mut rig = ShowRig::new(sched_config(3));
        rig.store.seed_rotation(vec![1, 4, 3], 1);
        rig.sched.restore(false).await;
        assert_eq!(rig.sched.queue(), &[3, 1], "inactive 4 is purged, 3 follows it");
        assert_eq!(rig.sched.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_drives_the_running_loop() {
        let rig = ShowRig::new(sched_config(3));
        let ShowRig {
            sched,
            handle,
            engine_events,
            ..
        } = rig;
        let task = sched.spawn(engine_events);
        let mut status = handle.subscribe_status();

        assert!(handle.start(vec![1, 2]));
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.rotation_active))
            .await
            .expect("status update")
            .unwrap();

        assert!(handle.shutdown());
        task.await.unwrap();
        assert!(!handle.stop(), "scheduler is gone");
    }

    #[tokio::test(start_paused = true)]
    async fn natural_track_end_advances_the_set() {
        let rig = ShowRig::new(sched_config(3));
        let ShowRig {
            sched,
            handle,
            engine,
            engine_events,
            ..
        } = rig;
        let monitor = engine.spawn_monitor();
        let task = sched.spawn(engine_events);
        handle.start(vec![1, 2]);

        // Library tracks run two minutes.
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(handle.status().song_number, 2);
        handle.shutdown();
        task.await.unwrap();
        monitor.abort();
    }
}
