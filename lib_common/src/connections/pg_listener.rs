//! # PostgreSQL Notification Feed
//!
//! Subscribes to a Postgres `NOTIFY` channel with `LISTEN` and forwards every notification as a
//! [`NotificationEvent`] onto the bridge's event channel.
//!
//! ## Connection lifecycle
//!
//! - [`PgNotificationFeed::connect`] opens one connection, spawns the task that drives it, and
//!   issues `LISTEN`. A failure here is returned to the caller; at startup it is fatal.
//! - [`PgNotificationFeed::run`] watches the live session and, when the connection drops,
//!   reconnects with exponential backoff until it succeeds or shutdown is requested. The loop
//!   itself is [`keep_alive`], which only sees a [`FeedSession`] and a connect function.

use std::future::Future;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tokio_util::sync::CancellationToken;

use crate::core::feed_bridge::{EventSender, NotificationEvent};

/// Default first reconnect delay.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1_000);
/// Default cap on the reconnect delay.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_millis(60_000);

/// Errors raised by the Postgres feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Opening the database connection failed.
    #[error("failed to connect to the notification database: {0}")]
    Connect(#[source] tokio_postgres::Error),

    /// The `LISTEN` statement failed.
    #[error("failed to LISTEN on channel '{channel}': {source}")]
    Listen {
        channel: String,
        #[source]
        source: tokio_postgres::Error,
    },

    /// The channel name cannot be used as an identifier.
    #[error("invalid notification channel name: {0:?}")]
    InvalidChannel(String),
}

/// # Reconnect Backoff
///
/// Doubling delay sequence starting at `base` and capped at `max`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Creates a backoff sequence.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Restarts the sequence after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_MAX_DELAY)
    }
}

/// Builds the `LISTEN` statement for `channel`, quoting it as an identifier so the name is used
/// exactly as given.
pub fn listen_statement(channel: &str) -> Result<String, FeedError> {
    if channel.is_empty() || channel.contains('\0') {
        return Err(FeedError::InvalidChannel(channel.to_string()));
    }
    Ok(format!("LISTEN \"{}\"", channel.replace('"', "\"\"")))
}

/// A live upstream connection as seen by the reconnect loop.
pub trait FeedSession: Send {
    /// Resolves when the connection has ended.
    fn closed(&mut self) -> impl Future<Output = ()> + Send + '_;

    /// Tears the connection down.
    fn abort(&self);
}

/// # Listen Session
///
/// One live connection. The `client` is kept alive for as long as the session exists; dropping
/// it would close the connection.
pub struct ListenSession {
    _client: Client,
    driver: JoinHandle<()>,
}

impl FeedSession for ListenSession {
    fn closed(&mut self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let _ = (&mut self.driver).await;
        }
    }

    fn abort(&self) {
        self.driver.abort();
    }
}

/// Why [`keep_alive`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedExit {
    /// `shutdown` was cancelled.
    Shutdown,
    /// The event receiver was dropped, so there is no one left to feed.
    BridgeGone,
}

/// # Keep Alive
///
/// Waits for `session` to end, then calls `connect` after each backoff delay until a new session
/// is established, and repeats. The backoff restarts after every successful connect. On shutdown
/// the current session is aborted.
pub async fn keep_alive<S, F, Fut>(
    channel: &str,
    mut backoff: ReconnectBackoff,
    mut session: S,
    mut connect: F,
    events: &EventSender,
    shutdown: &CancellationToken,
) -> FeedExit
where
    S: FeedSession,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, FeedError>>,
{
    loop {
        let lost = tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = session.closed() => true,
        };
        if !lost {
            session.abort();
            log::info!("Postgres listener on '{}' stopped", channel);
            return FeedExit::Shutdown;
        }
        log::warn!("Lost Postgres connection for channel '{}'", channel);

        session = loop {
            if events.is_closed() {
                log::debug!("Feed bridge is gone; not reconnecting '{}'", channel);
                return FeedExit::BridgeGone;
            }

            let delay = backoff.next_delay();
            log::info!(
                "Reconnecting to Postgres in {} ms (attempt {})",
                delay.as_millis(),
                backoff.attempt()
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return FeedExit::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }

            match connect().await {
                Ok(session) => {
                    backoff.reset();
                    log::info!("Postgres notifications on \"{}\" listening again", channel);
                    break session;
                }
                Err(e) => log::error!("Reconnect failed: {}", e),
            }
        };
    }
}

/// # Postgres Notification Feed
#[derive(Debug, Clone)]
pub struct PgNotificationFeed {
    database_url: String,
    channel: String,
    backoff: ReconnectBackoff,
}

impl PgNotificationFeed {
    /// Creates a feed for `channel` on the database at `database_url`.
    pub fn new(database_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel: channel.into(),
            backoff: ReconnectBackoff::default(),
        }
    }

    /// Overrides the reconnect delays.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = ReconnectBackoff::new(base, max);
        self
    }

    /// The channel this feed listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// # Connect
    ///
    /// Opens a connection, starts forwarding notifications to `events`, and issues `LISTEN`.
    pub async fn connect(&self, events: EventSender) -> Result<ListenSession, FeedError> {
        let statement = listen_statement(&self.channel)?;

        let (client, mut connection) = tokio_postgres::connect(&self.database_url, NoTls)
            .await
            .map_err(FeedError::Connect)?;

        // The connection only makes progress while it is polled, so the driver task both keeps
        // it alive and picks the notifications out of its message stream.
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        let driver = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        let event = NotificationEvent::new(
                            notification.channel(),
                            Some(notification.payload().to_string()),
                        );
                        if events.send(event).is_err() {
                            log::debug!("Feed bridge is gone; dropping Postgres connection");
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        log::debug!("Postgres notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Postgres connection error: {}", e);
                        break;
                    }
                }
            }
        });

        if let Err(source) = client.batch_execute(&statement).await {
            driver.abort();
            return Err(FeedError::Listen {
                channel: self.channel.clone(),
                source,
            });
        }

        Ok(ListenSession {
            _client: client,
            driver,
        })
    }

    /// # Run
    ///
    /// Keeps the feed alive with [`keep_alive`], reconnecting through [`Self::connect`]. Returns
    /// when `shutdown` is cancelled or the bridge stops listening.
    pub async fn run(&self, session: ListenSession, events: EventSender, shutdown: CancellationToken) -> FeedExit {
        keep_alive(
            &self.channel,
            self.backoff.clone(),
            session,
            || self.connect(events.clone()),
            &events,
            &shutdown,
        )
        .await
    }
}
