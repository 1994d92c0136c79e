//! Performer rotation model.
//!
//! The queue is cyclic: the performer on stage is always at the head, and a
//! finished set rotates them to the back. Per-cycle set assignments and the
//! operator's break slots live alongside it.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::catalog::Track;

pub type PerformerId = i64;

// ── Performers ────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Performer {
    pub id: PerformerId,
    pub name: String,
    /// Preferred track names, in the performer's order.
    #[serde(default)]
    pub playlist: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Overrides the show-wide songs-per-set.
    #[serde(default)]
    pub songs_per_set: Option<u32>,
}

impl Performer {
    pub fn songs_per_set_or(&self, default: u32) -> u32 {
        self.songs_per_set.filter(|&n| n > 0).unwrap_or(default).max(1)
    }
}

/// Read-only view of the performers the admin side knows about.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    performers: HashMap<PerformerId, Performer>,
}

impl Roster {
    pub fn new(performers: Vec<Performer>) -> Self {
        let mut roster = Self::default();
        roster.replace(performers);
        roster
    }

    pub fn replace(&mut self, performers: Vec<Performer>) {
        self.performers = performers.into_iter().map(|p| (p.id, p)).collect();
    }

    pub fn get(&self, id: PerformerId) -> Option<&Performer> {
        self.performers.get(&id)
    }

    pub fn is_active(&self, id: PerformerId) -> bool {
        self.performers.get(&id).is_some_and(|p| p.active)
    }

    pub fn display_name(&self, id: PerformerId) -> String {
        self.performers
            .get(&id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("Performer {id}"))
    }

    pub fn len(&self) -> usize {
        self.performers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.performers.is_empty()
    }
}

// ── Rotation queue ────────────────────────────────────────────────────────────

/// Ordered, duplicate-free cycle of active performer ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationQueue {
    order: Vec<PerformerId>,
}

impl RotationQueue {
    /// Build from a requested lineup, dropping duplicates and ids the roster
    /// does not know as active.
    pub fn from_ids(ids: &[PerformerId], roster: &Roster) -> Self {
        let mut seen = HashSet::new();
        let order = ids
            .iter()
            .copied()
            .filter(|id| roster.is_active(*id) && seen.insert(*id))
            .collect();
        Self { order }
    }

    /// Remove entries that are no longer active. Returns what was removed.
    pub fn purge(&mut self, roster: &Roster) -> Vec<PerformerId> {
        let mut seen = HashSet::new();
        let mut removed = Vec::new();
        self.order.retain(|id| {
            let keep = roster.is_active(*id) && seen.insert(*id);
            if !keep {
                removed.push(*id);
            }
            keep
        });
        removed
    }

    /// Head goes to the back; everyone else moves up one.
    pub fn rotate_to_back(&mut self) {
        if self.order.len() > 1 {
            self.order.rotate_left(1);
        }
    }

    /// Rotate the cycle so `id` is at the head. Returns `false` if absent.
    pub fn rotate_to(&mut self, id: PerformerId) -> bool {
        match self.order.iter().position(|&p| p == id) {
            Some(idx) => {
                self.order.rotate_left(idx);
                true
            }
            None => false,
        }
    }

    /// Move `id` to the back, keeping everyone else in order.
    pub fn move_to_back(&mut self, id: PerformerId) -> bool {
        match self.order.iter().position(|&p| p == id) {
            Some(idx) => {
                let p = self.order.remove(idx);
                self.order.push(p);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: PerformerId) -> bool {
        self.order.contains(&id)
    }

    pub fn get(&self, index: usize) -> Option<PerformerId> {
        self.order.get(index).copied()
    }

    pub fn current(&self) -> Option<PerformerId> {
        self.get(0)
    }

    /// Who follows `index` in the cycle.
    pub fn next_after(&self, index: usize) -> Option<PerformerId> {
        if self.order.is_empty() {
            return None;
        }
        self.get((index + 1) % self.order.len())
    }

    pub fn ids(&self) -> &[PerformerId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Playback position ─────────────────────────────────────────────────────────

/// Where the show is. The state machine view is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub performer_index: usize,
    /// 1-based song within the current set.
    pub song_number: u32,
    pub rotation_active: bool,
    pub playing_break: bool,
    pub break_index: usize,
}

impl Default for PlaybackPosition {
    fn default() -> Self {
        Self {
            performer_index: 0,
            song_number: 1,
            rotation_active: false,
            playing_break: false,
            break_index: 0,
        }
    }
}

impl PlaybackPosition {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn state(&self) -> SchedulerState {
        if !self.rotation_active {
            SchedulerState::Idle
        } else if self.playing_break {
            SchedulerState::PlayingBreak {
                performer_index: self.performer_index,
                break_index: self.break_index,
            }
        } else {
            SchedulerState::PlayingSet {
                performer_index: self.performer_index,
                song_number: self.song_number,
            }
        }
    }

    pub fn enter_set(&mut self, performer_index: usize) {
        *self = Self {
            performer_index,
            song_number: 1,
            rotation_active: true,
            playing_break: false,
            break_index: 0,
        };
    }

    pub fn enter_break(&mut self, performer_index: usize) {
        *self = Self {
            performer_index,
            song_number: 1,
            rotation_active: true,
            playing_break: true,
            break_index: 0,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    PlayingSet {
        performer_index: usize,
        song_number: u32,
    },
    PlayingBreak {
        performer_index: usize,
        break_index: usize,
    },
}

// ── Assignments ───────────────────────────────────────────────────────────────

/// Tracks chosen for one performer's turn, plus spares from the same batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAssignment {
    pub tracks: Vec<Track>,
    pub spares: Vec<Track>,
}

impl SetAssignment {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetAssignments {
    sets: HashMap<PerformerId, SetAssignment>,
}

impl SetAssignments {
    pub fn insert(&mut self, id: PerformerId, set: SetAssignment) {
        self.sets.insert(id, set);
    }

    pub fn get(&self, id: PerformerId) -> Option<&SetAssignment> {
        self.sets.get(&id)
    }

    pub fn contains(&self, id: PerformerId) -> bool {
        self.sets.get(&id).is_some_and(|s| !s.is_empty())
    }

    pub fn remove(&mut self, id: PerformerId) -> Option<SetAssignment> {
        self.sets.remove(&id)
    }

    pub fn retain_ids(&mut self, keep: impl Fn(PerformerId) -> bool) {
        self.sets.retain(|id, _| keep(*id));
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    /// Track for 1-based `song_number`.
    pub fn track_for(&self, id: PerformerId, song_number: u32) -> Option<Track> {
        let idx = (song_number as usize).checked_sub(1)?;
        self.sets.get(&id)?.tracks.get(idx).cloned()
    }

    pub fn spares(&self, id: PerformerId) -> Vec<Track> {
        self.sets.get(&id).map(|s| s.spares.clone()).unwrap_or_default()
    }

    /// A spare went on air in place of a failed track; it is no longer spare.
    pub fn consume_spare(&mut self, id: PerformerId, name: &str) {
        if let Some(set) = self.sets.get_mut(&id) {
            set.spares.retain(|t| t.name != name);
        }
    }

    /// Names held by everyone except `id`, spares included: a spare can go
    /// on air in place of a failed track.
    pub fn assigned_names_except(&self, id: PerformerId) -> Vec<String> {
        self.names_where(|pid| pid != id)
    }

    /// Every name held by any set, spares included.
    pub fn assigned_names(&self) -> Vec<String> {
        self.names_where(|_| true)
    }

    fn names_where(&self, keep: impl Fn(PerformerId) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .sets
            .iter()
            .filter(|(pid, _)| keep(**pid))
            .flat_map(|(_, s)| s.tracks.iter().chain(&s.spares).map(|t| t.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Break songs keyed by the performer they follow.
#[derive(Debug, Clone, Default)]
pub struct InterstitialAssignments {
    slots: HashMap<PerformerId, Vec<Track>>,
}

impl InterstitialAssignments {
    /// Replace the slot after `after`; an empty list clears it.
    pub fn set(&mut self, after: PerformerId, tracks: Vec<Track>) {
        if tracks.is_empty() {
            self.slots.remove(&after);
        } else {
            self.slots.insert(after, tracks);
        }
    }

    pub fn has_break_after(&self, after: PerformerId) -> bool {
        self.slots.get(&after).is_some_and(|t| !t.is_empty())
    }

    pub fn get(&self, after: PerformerId) -> Option<&[Track]> {
        self.slots.get(&after).map(Vec::as_slice)
    }

    /// Remove and return the slot; a break plays once.
    pub fn take(&mut self, after: PerformerId) -> Vec<Track> {
        self.slots.remove(&after).unwrap_or_default()
    }

    pub fn retain_ids(&mut self, keep: impl Fn(PerformerId) -> bool) {
        self.slots.retain(|id, _| keep(*id));
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
