use crate::notes_logic::config::Config;
use anyhow::{Context, Result};
use lib_common::connections::PgNotificationFeed;
use lib_common::core::Relay;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background tasks that keep notifications flowing into the relay.
pub struct UpstreamTasks {
    pub feed: JoinHandle<()>,
    pub bridge: JoinHandle<()>,
}

impl UpstreamTasks {
    /// Waits for both tasks to stop.
    pub async fn join(self) {
        let (feed, bridge) = tokio::join!(self.feed, self.bridge);
        if let Err(e) = feed {
            log::error!("Postgres listener task failed: {}", e);
        }
        if let Err(e) = bridge {
            log::error!("Feed bridge task failed: {}", e);
        }
    }
}

/// Connects to Postgres, starts listening, and spawns the feed and bridge tasks.
///
/// The first connection is made before returning so that an unreachable database fails startup.
/// Later connection losses are handled inside the feed task with backoff.
pub async fn start(config: &Config, relay: &Relay, shutdown: CancellationToken) -> Result<UpstreamTasks> {
    let feed = PgNotificationFeed::new(config.database_url.as_str(), config.notify_channel.as_str())
        .with_backoff(config.reconnect_base_delay(), config.reconnect_max_delay());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let session = feed
        .connect(events_tx.clone())
        .await
        .with_context(|| format!("Failed to start Postgres listener on \"{}\"", feed.channel()))?;
    log::info!("Postgres notifications on \"{}\" listening", feed.channel());

    let bridge = relay.bridge(config.notify_channel.as_str());

    let feed_shutdown = shutdown.clone();
    let feed_task = tokio::spawn(async move {
        let exit = feed.run(session, events_tx, feed_shutdown).await;
        log::debug!("Postgres feed finished: {:?}", exit);
    });
    let bridge_task = tokio::spawn(async move {
        bridge.run(events_rx, shutdown).await;
    });

    Ok(UpstreamTasks {
        feed: feed_task,
        bridge: bridge_task,
    })
}
