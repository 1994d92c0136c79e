use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use super::remote::Command;
use crate::{
    clock::Clock,
    error::{Error, Result},
    events::PlaybackStatus,
    scheduler::show::SchedulerHandle,
};

const MIN_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedMessage {
    // Feed → player
    Command { command: Command },

    // Player → feed
    Ack { upto_id: u64 },
    Status { status: PlaybackStatus },
}

/// WebSocket link to the remote command surface.
///
/// Inbound commands go to the scheduler stamped with their arrival time;
/// acknowledgements and status changes go back out. The link reconnects
/// with backoff until the task is aborted.
#[derive(Clone)]
pub struct CommandFeed {
    url: String,
    token: String,
}

impl CommandFeed {
    pub fn new(url: String, token: String) -> Self {
        Self { url, token }
    }

    pub fn spawn(
        self,
        scheduler: SchedulerHandle,
        mut acks: mpsc::UnboundedReceiver<u64>,
        clock: Arc<dyn Clock>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = MIN_BACKOFF;
            loop {
                match self.run_session(&scheduler, &mut acks, clock.as_ref()).await {
                    Ok(()) => {
                        log::info!("Command feed closed by remote");
                        backoff = MIN_BACKOFF;
                    }
                    Err(e) => log::warn!("Command feed: {e}"),
                }
                log::debug!("Command feed reconnecting in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }

    async fn run_session(
        &self,
        scheduler: &SchedulerHandle,
        acks: &mut mpsc::UnboundedReceiver<u64>,
        clock: &dyn Clock,
    ) -> Result<()> {
        let ws_url = format!("{}/player-feed?token={}", self.url, self.token);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| Error::Feed(format!("connection failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        log::info!("Command feed connected to {}", self.url);

        let mut status_rx = scheduler.subscribe_status();
        let snapshot = status_rx.borrow_and_update().clone();
        send_json(&mut write, &FeedMessage::Status { status: snapshot }).await?;

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let msg = match incoming {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(Error::Feed(format!("read failed: {e}"))),
                        None => return Ok(()),
                    };
                    match msg {
                        Message::Text(text) => match serde_json::from_str::<FeedMessage>(&text) {
                            Ok(FeedMessage::Command { command }) => {
                                scheduler.submit_command(command, clock.now_ms());
                            }
                            Ok(other) => log::debug!("Ignoring feed message {other:?}"),
                            Err(e) => log::warn!("Unparseable feed message: {e}"),
                        },
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
                Some(upto_id) = acks.recv() => {
                    send_json(&mut write, &FeedMessage::Ack { upto_id }).await?;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let status = status_rx.borrow_and_update().clone();
                    send_json(&mut write, &FeedMessage::Status { status }).await?;
                }
            }
        }
    }
}

async fn send_json<S>(write: &mut S, msg: &FeedMessage) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg)?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| Error::Feed(format!("send failed: {e}")))
}
