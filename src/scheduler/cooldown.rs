use std::collections::HashMap;

/// Last-played times by track name, with a fixed expiry window.
///
/// Entries are never needed after the window passes. Every
/// [`stamp`](Self::stamp) prunes them, so the map holds at most the tracks
/// played within one window.
#[derive(Debug, Clone)]
pub struct CooldownRegistry {
    window_ms: u64,
    entries: HashMap<String, u64>,
}

impl CooldownRegistry {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            entries: HashMap::new(),
        }
    }

    /// Rebuild from persisted `(name, last_played_ms)` rows.
    pub fn from_entries(window_ms: u64, entries: HashMap<String, u64>) -> Self {
        Self { window_ms, entries }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn stamp(&mut self, name: &str, now_ms: u64) {
        self.prune(now_ms);
        self.entries.insert(name.to_string(), now_ms);
    }

    pub fn is_cooling(&self, name: &str, now_ms: u64) -> bool {
        self.entries
            .get(name)
            .is_some_and(|&at| now_ms.saturating_sub(at) < self.window_ms)
    }

    /// Names still inside the window, sorted for stable queries.
    pub fn cooling_names(&self, now_ms: u64) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, &at)| now_ms.saturating_sub(at) < self.window_ms)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn last_played(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    pub fn prune(&mut self, now_ms: u64) {
        let window = self.window_ms;
        self.entries.retain(|_, at| now_ms.saturating_sub(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
