//! # Feed Bridge
//!
//! Connects the upstream notification feed to the [`Broadcaster`]. The feed (for example the
//! Postgres listener in [`crate::connections`]) pushes [`NotificationEvent`]s onto a channel; the
//! bridge drains that channel, keeps the events for its configured channel name, and broadcasts
//! each non-empty payload synchronously before taking the next event.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::broadcaster::{BroadcastReport, Broadcaster};

/// Default upstream channel name.
pub const DEFAULT_NOTIFY_CHANNEL: &str = "note_changes";

/// One notification from the upstream feed. Transient: consumed by the bridge, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// Channel the notification was published on.
    pub channel: String,
    /// Notification payload, if any.
    pub payload: Option<String>,
}

impl NotificationEvent {
    /// Builds an event.
    pub fn new(channel: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Sending half of the feed's event channel.
pub type EventSender = mpsc::UnboundedSender<NotificationEvent>;
/// Receiving half of the feed's event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<NotificationEvent>;

/// # Feed Bridge
pub struct FeedBridge {
    channel: String,
    broadcaster: Arc<Broadcaster>,
}

impl FeedBridge {
    /// Creates a bridge relaying events on `channel` to `broadcaster`.
    pub fn new(channel: impl Into<String>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            channel: channel.into(),
            broadcaster,
        }
    }

    /// The channel this bridge relays.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Handles one event. Returns the broadcast report, or `None` when the event was ignored
    /// (other channel, or missing/empty payload).
    pub fn handle_event(&self, event: NotificationEvent) -> Option<BroadcastReport> {
        if event.channel != self.channel {
            log::debug!("Ignoring notification on channel '{}'", event.channel);
            return None;
        }

        let payload = event.payload.filter(|payload| !payload.is_empty())?;
        let report = self.broadcaster.broadcast(&payload);
        log::trace!(
            "Relayed {} bytes: delivered={} throttled={} failed={}",
            payload.len(),
            report.delivered,
            report.throttled,
            report.failed
        );
        Some(report)
    }

    /// Drains `events` until the feed closes its side or `shutdown` is cancelled.
    pub async fn run(&self, mut events: EventReceiver, shutdown: CancellationToken) {
        log::info!("Feed bridge relaying channel '{}'", self.channel);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        log::warn!("Notification feed closed; bridge stopping");
                        break;
                    }
                },
            }
        }
    }
}
