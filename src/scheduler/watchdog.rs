use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::{
    selection::TrackSelector,
    show::SchedulerHandle,
    transition::{LockOwner, TransitionLock},
};
use crate::{
    audio::DeckEngine,
    clock::Clock,
    config::WatchdogConfig,
    events::{EventBus, ShowEvent},
};

/// Result of one watchdog pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Disabled,
    /// Nothing should be audible (idle, or paused by the operator).
    NotExpected,
    Healthy,
    /// Silent, but a transition holds the lock.
    Busy,
    Recovered { track: String },
    /// No track could be loaded; `resume()` revived the active deck.
    Resumed,
    Failed,
}

/// Supervises the audio heartbeat and restarts playback after silence.
pub struct Watchdog {
    config: WatchdogConfig,
    engine: DeckEngine,
    selector: Arc<TrackSelector>,
    lock: TransitionLock,
    scheduler: SchedulerHandle,
    clock: Arc<dyn Clock>,
    bus: EventBus,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        engine: DeckEngine,
        selector: Arc<TrackSelector>,
        lock: TransitionLock,
        scheduler: SchedulerHandle,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            engine,
            selector,
            lock,
            scheduler,
            clock,
            bus,
        }
    }

    /// Check on a fixed tick until aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(self.config.tick_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let verdict = self.check().await;
                if !matches!(
                    verdict,
                    WatchdogVerdict::Healthy | WatchdogVerdict::NotExpected | WatchdogVerdict::Disabled
                ) {
                    log::debug!("Watchdog: {verdict:?}");
                }
            }
        })
    }

    pub async fn check(&self) -> WatchdogVerdict {
        if !self.config.enabled {
            return WatchdogVerdict::Disabled;
        }
        let status = self.scheduler.status();
        let expected =
            (status.rotation_active || status.fallback_playing) && !self.engine.is_paused();
        if !expected {
            return WatchdogVerdict::NotExpected;
        }

        let silent_for = self
            .clock
            .now_ms()
            .saturating_sub(self.engine.last_activity_ms());
        if silent_for <= self.config.silence_threshold_ms {
            return WatchdogVerdict::Healthy;
        }

        let Some(guard) = self.lock.try_acquire(LockOwner::Recovery) else {
            return WatchdogVerdict::Busy;
        };
        if guard.was_forced() {
            self.engine.settle();
        }
        log::warn!("No audio for {silent_for} ms; recovering playback");

        let verdict = self.recover().await;
        drop(guard);

        self.bus.emit_lossy(ShowEvent::WatchdogRecovery {
            silent_for_ms: silent_for,
            recovered: !matches!(verdict, WatchdogVerdict::Failed),
        });
        verdict
    }

    async fn recover(&self) -> WatchdogVerdict {
        let exclude: Vec<String> = self.engine.now_playing().map(|t| t.key).into_iter().collect();
        let batch = self
            .selector
            .random_fallback(self.config.recovery_batch, &exclude, &[])
            .await;
        for track in batch {
            if self.engine.play_track(&track, false) {
                log::info!("Watchdog recovered with '{}'", track.name);
                self.selector.stamp(&track.name).await;
                let name = track.name.clone();
                self.scheduler.notify_recovery(track);
                return WatchdogVerdict::Recovered { track: name };
            }
        }

        if self.engine.resume() {
            log::warn!("Watchdog found no loadable track; resumed the active deck");
            WatchdogVerdict::Resumed
        } else {
            log::error!("Watchdog could not restore playback");
            WatchdogVerdict::Failed
        }
    }
}
