use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Who holds the transition lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// An ordinary scheduler transition (start, next song, handover, break).
    Transition,
    /// Watchdog recovery.
    Recovery,
}

struct Holder {
    owner: LockOwner,
    since_ms: u64,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    next_generation: u64,
    /// `[start, end]` of the most recent completed transition.
    last_window: Option<(u64, u64)>,
}

/// Single mutual-exclusion point for state-changing transitions and
/// watchdog recovery.
///
/// Acquisition never waits: a busy lock drops the attempt. A holder older
/// than the stale threshold is force-cleared and its token cancelled, so a
/// wedged transition cannot block the show forever.
#[derive(Clone)]
pub struct TransitionLock {
    inner: Arc<Mutex<LockState>>,
    clock: Arc<dyn Clock>,
    stale_ms: u64,
}

impl TransitionLock {
    pub fn new(clock: Arc<dyn Clock>, stale_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LockState::default())),
            clock,
            stale_ms,
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_acquire(&self, owner: LockOwner) -> Option<TransitionGuard> {
        let now = self.clock.now_ms();
        let mut st = self.state();
        let mut forced = false;
        if let Some(held) = &st.holder {
            let age = now.saturating_sub(held.since_ms);
            if age < self.stale_ms {
                log::debug!("{owner:?} dropped: lock held by {:?} for {age} ms", held.owner);
                return None;
            }
            log::warn!(
                "Force-clearing {:?} lock held for {age} ms (requested by {owner:?})",
                held.owner
            );
            held.cancel.cancel();
            forced = true;
        }

        st.next_generation += 1;
        let generation = st.next_generation;
        let cancel = CancellationToken::new();
        st.holder = Some(Holder {
            owner,
            since_ms: now,
            generation,
            cancel: cancel.clone(),
        });
        Some(TransitionGuard {
            lock: self.clone(),
            owner,
            generation,
            cancel,
            forced,
        })
    }

    pub fn holder(&self) -> Option<LockOwner> {
        self.state().holder.as_ref().map(|h| h.owner)
    }

    pub fn is_held(&self) -> bool {
        self.state().holder.is_some()
    }

    /// Whether `at_ms` falls inside a transition: the one in flight, or the
    /// last one that completed.
    pub fn within_transition_window(&self, at_ms: u64) -> bool {
        let st = self.state();
        if let Some(held) = &st.holder {
            if held.owner == LockOwner::Transition && at_ms >= held.since_ms {
                return true;
            }
        }
        st.last_window
            .is_some_and(|(start, end)| at_ms >= start && at_ms <= end)
    }

    fn release(&self, generation: u64) {
        let now = self.clock.now_ms();
        let mut st = self.state();
        let Some((owner, since_ms)) = st
            .holder
            .as_ref()
            // A force-cleared holder must not release its successor.
            .filter(|h| h.generation == generation)
            .map(|h| (h.owner, h.since_ms))
        else {
            return;
        };
        if owner == LockOwner::Transition {
            st.last_window = Some((since_ms, now));
        }
        st.holder = None;
    }
}

/// Held for the duration of one transition or recovery; releases on drop.
pub struct TransitionGuard {
    lock: TransitionLock,
    owner: LockOwner,
    generation: u64,
    cancel: CancellationToken,
    forced: bool,
}

impl TransitionGuard {
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// The previous holder was stale and got force-cleared.
    pub fn was_forced(&self) -> bool {
        self.forced
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.lock.release(self.generation);
    }
}
