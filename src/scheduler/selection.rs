use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::seq::SliceRandom;

use super::{
    cooldown::CooldownRegistry,
    rotation::{Performer, SetAssignment},
};
use crate::{
    catalog::{SelectionQuery, Track, TrackCatalog},
    clock::Clock,
    config::{SchedulerConfig, SelectionPolicy},
    db::ShowStore,
    error::{Error, Result},
};

// ── Local pool ────────────────────────────────────────────────────────────────

/// Tracks seen from the catalog, kept for when the catalog is unreachable.
#[derive(Debug, Clone, Default)]
pub struct TrackPool {
    tracks: Vec<Track>,
    limit: usize,
}

impl TrackPool {
    pub fn new(limit: usize) -> Self {
        Self {
            tracks: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Add unseen tracks (by key); the oldest entries go once over the limit.
    pub fn absorb(&mut self, batch: &[Track]) {
        let known: HashSet<&str> = self.tracks.iter().map(|t| t.key.as_str()).collect();
        let fresh: Vec<Track> = batch
            .iter()
            .filter(|t| !known.contains(t.key.as_str()))
            .cloned()
            .collect();
        self.tracks.extend(fresh);
        if self.tracks.len() > self.limit {
            let excess = self.tracks.len() - self.limit;
            self.tracks.drain(..excess);
        }
    }

    pub fn by_name(&self, name: &str) -> Option<Track> {
        self.tracks.iter().find(|t| t.name == name).cloned()
    }

    /// Up to `count` tracks outside `exclude`, matching `genres` when given.
    ///
    /// Tracks whose cooldown expired come first, in random order; the rest
    /// is filled least-recently-played first, cooldown or not.
    pub fn pick(
        &self,
        count: usize,
        exclude: &HashSet<String>,
        genres: &[String],
        cooldowns: &CooldownRegistry,
        now_ms: u64,
    ) -> Vec<Track> {
        let mut seen = HashSet::new();
        let candidates: Vec<&Track> = self
            .tracks
            .iter()
            .filter(|t| genre_matches(t, genres))
            .filter(|t| !exclude.contains(&t.name))
            .filter(|t| seen.insert(t.name.as_str()))
            .collect();

        fresh_first(candidates, count, cooldowns, now_ms, true)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Expired tracks first (shuffled when `shuffle` is set, else in the given
/// order), then cooling ones least-recently-played first.
fn fresh_first(
    candidates: Vec<&Track>,
    count: usize,
    cooldowns: &CooldownRegistry,
    now_ms: u64,
    shuffle: bool,
) -> Vec<Track> {
    let (mut fresh, mut cooling): (Vec<&Track>, Vec<&Track>) = candidates
        .into_iter()
        .partition(|t| !cooldowns.is_cooling(&t.name, now_ms));
    if shuffle {
        fresh.shuffle(&mut rand::thread_rng());
    }
    cooling.sort_by_key(|t| cooldowns.last_played(&t.name).unwrap_or(0));

    fresh
        .into_iter()
        .chain(cooling)
        .take(count)
        .cloned()
        .collect()
}

fn genre_matches(track: &Track, genres: &[String]) -> bool {
    if genres.is_empty() {
        return true;
    }
    track
        .genre
        .as_deref()
        .is_some_and(|g| genres.iter().any(|want| want.eq_ignore_ascii_case(g)))
}

// ── Selector ──────────────────────────────────────────────────────────────────

/// Cooldown-aware track selection over the catalog with a local fallback.
///
/// Shared between the scheduler and the watchdog; internal state sits behind
/// short-lived locks that are never held across an await.
pub struct TrackSelector {
    catalog: Arc<dyn TrackCatalog>,
    store: Arc<dyn ShowStore>,
    clock: Arc<dyn Clock>,
    policy: SelectionPolicy,
    genres: Vec<String>,
    spare_tracks: usize,
    pool_size: usize,
    timeout: Duration,
    cooldowns: Mutex<CooldownRegistry>,
    pool: Mutex<TrackPool>,
}

impl TrackSelector {
    pub fn new(
        catalog: Arc<dyn TrackCatalog>,
        store: Arc<dyn ShowStore>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            clock,
            policy: config.selection_policy,
            genres: config.active_genres.clone(),
            spare_tracks: config.spare_tracks,
            pool_size: config.local_pool_size,
            timeout: Duration::from_millis(config.catalog_timeout_ms),
            cooldowns: Mutex::new(CooldownRegistry::new(config.cooldown_ms)),
            pool: Mutex::new(TrackPool::new(config.local_pool_size)),
        }
    }

    fn cooldowns(&self) -> MutexGuard<'_, CooldownRegistry> {
        self.cooldowns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pool(&self) -> MutexGuard<'_, TrackPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::CatalogTimeout(self.timeout))?
    }

    // ── Startup ───────────────────────────────────────────────────────────

    /// Reload persisted cooldowns, dropping what already expired.
    pub async fn load_cooldowns(&self) {
        match self.store.load_cooldowns().await {
            Ok(rows) => {
                let now = self.clock.now_ms();
                let mut reg = self.cooldowns();
                let window = reg.window_ms();
                *reg = CooldownRegistry::from_entries(window, rows);
                reg.prune(now);
                log::info!("Loaded {} active track cooldowns", reg.len());
            }
            Err(e) => log::warn!("Could not load track cooldowns: {e}"),
        }
    }

    /// Fill the local pool from the catalog.
    pub async fn seed_pool(&self) {
        match self
            .bounded(self.catalog.random_tracks(self.pool_size, &[], &self.genres))
            .await
        {
            Ok(batch) => {
                let mut pool = self.pool();
                pool.absorb(&batch);
                log::info!("Local track pool seeded with {} tracks", pool.len());
            }
            Err(e) => log::warn!("Local track pool not seeded: {e}"),
        }
    }

    // ── Selection ─────────────────────────────────────────────────────────

    /// Choose `songs_per_set` tracks (plus spares) for `performer`, never
    /// reusing a name in `assigned_elsewhere`.
    pub async fn select_for_performer(
        &self,
        performer: &Performer,
        songs_per_set: u32,
        assigned_elsewhere: &[String],
    ) -> SetAssignment {
        let need = songs_per_set as usize;
        let want = need + self.spare_tracks;
        let now = self.clock.now_ms();
        let assigned: HashSet<String> = assigned_elsewhere.iter().cloned().collect();

        let mut exclude_names: Vec<String> = assigned.iter().cloned().collect();
        exclude_names.extend(self.cooldowns().cooling_names(now));
        exclude_names.sort();
        exclude_names.dedup();

        let preferred = match self.policy {
            SelectionPolicy::PlaylistFirst => {
                let mut list = performer.playlist.clone();
                list.shuffle(&mut rand::thread_rng());
                list
            }
            SelectionPolicy::FoldersOnly => Vec::new(),
        };

        let query = SelectionQuery {
            count: want,
            exclude_names,
            genres: self.genres.clone(),
            preferred: preferred.clone(),
        };

        let mut chosen = match self.bounded(self.catalog.select_tracks(&query)).await {
            Ok(batch) => {
                self.pool().absorb(&batch);
                let mut seen = HashSet::new();
                let mut batch: Vec<Track> = batch
                    .into_iter()
                    .filter(|t| !assigned.contains(&t.name) && seen.insert(t.name.clone()))
                    .collect();
                if !preferred.is_empty() {
                    let rank: HashMap<&str, usize> = preferred
                        .iter()
                        .enumerate()
                        .map(|(i, n)| (n.as_str(), i))
                        .collect();
                    // Stable: playlist hits first, in shuffled playlist order.
                    batch.sort_by_key(|t| rank.get(t.name.as_str()).copied().unwrap_or(usize::MAX));
                }
                batch
            }
            Err(e) => {
                log::warn!(
                    "Catalog selection for {} failed ({e}); using local pool",
                    performer.name
                );
                self.pool()
                    .pick(want, &assigned, &self.genres, &self.cooldowns(), now)
            }
        };

        if chosen.len() < want {
            let mut exclude = assigned.clone();
            exclude.extend(chosen.iter().map(|t| t.name.clone()));
            let topup = self.pool().pick(
                want - chosen.len(),
                &exclude,
                &self.genres,
                &self.cooldowns(),
                now,
            );
            if !topup.is_empty() {
                log::debug!("Topped up {}'s set with {} pool tracks", performer.name, topup.len());
            }
            chosen.extend(topup);
        }

        // A tiny library can still leave the set short; repeat rather than
        // cut the set.
        if !chosen.is_empty() && chosen.len() < need {
            let base = chosen.clone();
            chosen.extend(base.iter().cycle().take(need - base.len()).cloned());
        }

        let spares = if chosen.len() > need {
            chosen.split_off(need)
        } else {
            Vec::new()
        };
        if chosen.is_empty() {
            log::warn!("No tracks available for {}", performer.name);
        }
        SetAssignment {
            tracks: chosen,
            spares,
        }
    }

    /// A random batch for break fills, house music and recovery.
    ///
    /// `exclude_keys` never come back; names in `avoid_names` (tracks held
    /// by sets) are dropped too. Cooling tracks are only used once every
    /// fresh one is taken.
    pub async fn random_fallback(
        &self,
        count: usize,
        exclude_keys: &[String],
        avoid_names: &[String],
    ) -> Vec<Track> {
        let now = self.clock.now_ms();
        let avoid: HashSet<String> = avoid_names.iter().cloned().collect();
        // Over-fetch so cooling and avoided tracks can be pushed out.
        let cooling = self.cooldowns().len();
        let fetch = (count + cooling + avoid.len()).min(self.pool_size.max(count));

        match self
            .bounded(self.catalog.random_tracks(fetch, exclude_keys, &self.genres))
            .await
        {
            Ok(batch) => {
                self.pool().absorb(&batch);
                let mut seen = HashSet::new();
                let candidates: Vec<&Track> = batch
                    .iter()
                    .filter(|t| !avoid.contains(&t.name) && seen.insert(t.name.as_str()))
                    .collect();
                let ranked = fresh_first(candidates, count, &self.cooldowns(), now, false);
                if !ranked.is_empty() {
                    return ranked;
                }
                log::warn!("Catalog returned no usable random tracks; using local pool");
            }
            Err(e) => log::warn!("Random tracks unavailable ({e}); using local pool"),
        }
        self.pick_from_pool(count, exclude_keys, &avoid, now)
    }

    fn pick_from_pool(
        &self,
        count: usize,
        exclude_keys: &[String],
        avoid: &HashSet<String>,
        now: u64,
    ) -> Vec<Track> {
        let pool = self.pool();
        let keys: HashSet<&str> = exclude_keys.iter().map(String::as_str).collect();
        let mut exclude: HashSet<String> = pool
            .tracks
            .iter()
            .filter(|t| keys.contains(t.key.as_str()))
            .map(|t| t.name.clone())
            .collect();
        exclude.extend(avoid.iter().cloned());
        pool.pick(count, &exclude, &self.genres, &self.cooldowns(), now)
    }

    pub async fn resolve_by_name(&self, name: &str) -> Option<Track> {
        match self.bounded(self.catalog.resolve_by_name(name)).await {
            Ok(Some(track)) => {
                self.pool().absorb(std::slice::from_ref(&track));
                Some(track)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Resolving '{name}' failed ({e}); trying local pool");
                self.pool().by_name(name)
            }
        }
    }

    // ── Cooldowns ─────────────────────────────────────────────────────────

    /// Record an actual play now, and persist it.
    pub async fn stamp(&self, name: &str) {
        let now = self.clock.now_ms();
        self.cooldowns().stamp(name, now);
        if let Err(e) = self.store.save_cooldown(name, now).await {
            log::warn!("Could not persist cooldown for '{name}': {e}");
        }
    }

    pub fn is_cooling(&self, name: &str) -> bool {
        self.cooldowns().is_cooling(name, self.clock.now_ms())
    }

    pub fn pool_len(&self) -> usize {
        self.pool().len()
    }
}
