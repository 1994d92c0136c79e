use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    audio::{AudioOutput, DeckEngine},
    catalog::TrackCatalog,
    clock::Clock,
    config::ShowConfig,
    db::ShowStore,
    events::EventBus,
    gateway::{announcer::AnnouncementGateway, client::CommandFeed},
    scheduler::{
        selection::TrackSelector,
        show::{RotationScheduler, SchedulerDeps},
        transition::TransitionLock,
        SchedulerHandle, Watchdog,
    },
};

/// Event bus depth. Slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 512;

/// External collaborators the show runs against.
pub struct Backends {
    pub output: Arc<dyn AudioOutput>,
    pub catalog: Arc<dyn TrackCatalog>,
    pub announcer: Option<Arc<dyn AnnouncementGateway>>,
    pub store: Arc<dyn ShowStore>,
    pub clock: Arc<dyn Clock>,
}

/// Everything a running show owns: shared handles plus the background tasks.
pub struct AppState {
    pub engine: DeckEngine,
    pub scheduler: SchedulerHandle,
    pub bus: EventBus,
    pub lock: TransitionLock,
    pub feed: Option<CommandFeed>,
    tasks: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Wire the components, restore persisted state and start every task.
    pub async fn launch(config: ShowConfig, backends: Backends) -> Self {
        let Backends {
            output,
            catalog,
            announcer,
            store,
            clock,
        } = backends;

        let bus = EventBus::new(EVENT_CAPACITY);
        let (engine, engine_events) = DeckEngine::new(output, config.engine.clone(), clock.clone());
        let selector = Arc::new(TrackSelector::new(
            catalog,
            store.clone(),
            clock.clone(),
            &config.scheduler,
        ));
        let lock = TransitionLock::new(clock.clone(), config.scheduler.stale_transition_ms);

        let (ack_tx, ack_rx) = match config.command_feed_url {
            Some(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let (mut scheduler, handle) = RotationScheduler::new(
            config.scheduler.clone(),
            config.performers.clone(),
            config.lineup.clone(),
            SchedulerDeps {
                engine: engine.clone(),
                selector: selector.clone(),
                announcer,
                store,
                clock: clock.clone(),
                lock: lock.clone(),
                bus: bus.clone(),
                acks: ack_tx,
            },
        );
        scheduler.restore(config.auto_start).await;

        let mut tasks = vec![scheduler.spawn(engine_events), engine.spawn_monitor()];

        if config.watchdog.enabled {
            let watchdog = Watchdog::new(
                config.watchdog.clone(),
                engine.clone(),
                selector,
                lock.clone(),
                handle.clone(),
                clock.clone(),
                bus.clone(),
            );
            tasks.push(watchdog.spawn());
        } else {
            log::info!("Watchdog disabled");
        }

        let feed = match (config.command_feed_url.clone(), ack_rx) {
            (Some(url), Some(acks)) => {
                let feed = CommandFeed::new(url, config.command_feed_token.clone());
                tasks.push(feed.clone().spawn(handle.clone(), acks, clock));
                Some(feed)
            }
            _ => None,
        };

        log::info!(
            "Show ready: {} performers, {} in lineup",
            config.performers.len(),
            config.lineup.len()
        );

        Self {
            engine,
            scheduler: handle,
            bus,
            lock,
            feed,
            tasks,
        }
    }

    /// Stop the show, let the scheduler drain, then abort the helpers.
    pub async fn shutdown(mut self) {
        self.scheduler.stop();
        self.scheduler.shutdown();
        // The scheduler task is first; give it a moment to finish its queue.
        if let Some(first) = self.tasks.first_mut() {
            if tokio::time::timeout(Duration::from_secs(5), first).await.is_err() {
                log::warn!("Scheduler did not stop within 5 s");
            }
        }
        for task in self.tasks.drain(..).skip(1) {
            task.abort();
        }
        self.engine.settle();
        log::info!("Show shut down");
    }
}
