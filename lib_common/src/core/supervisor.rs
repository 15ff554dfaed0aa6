//! # Connection Supervisor
//!
//! Runs two timers for every OPEN subscriber:
//!
//! - **Heartbeat**: every `heartbeat_interval` a ping is queued on the subscriber's transport.
//!   Detecting a peer that never answers is left to the transport, which surfaces it as a close.
//! - **Lifetime**: once, after `max_lifetime`, the subscriber is closed with
//!   [`CloseReason::LifetimeExpired`] whether or not it was active.
//!
//! Both timers listen on the handle's cancellation token, which the registry cancels on every
//! exit from OPEN. A timer that outlives its subscriber would keep a stale identity alive, so
//! neither task holds anything but the handle it was given.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::subscriber::{CloseReason, SubscriberHandle, SubscriberId};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// Default maximum connection lifetime.
pub const DEFAULT_MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(30 * 60);

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Heartbeat and lifetime policy shared by every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSupervisor {
    heartbeat_interval: Duration,
    max_lifetime: Duration,
}

impl ConnectionSupervisor {
    /// Creates a supervisor. Periods shorter than a millisecond are rounded up.
    pub fn new(heartbeat_interval: Duration, max_lifetime: Duration) -> Self {
        Self {
            heartbeat_interval: heartbeat_interval.max(MIN_PERIOD),
            max_lifetime: max_lifetime.max(MIN_PERIOD),
        }
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Maximum lifetime of a connection.
    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// # Supervise
    ///
    /// Spawns the heartbeat and lifetime tasks for `handle`. When the lifetime expires the
    /// transport is asked to close and `on_expire` is called with the subscriber's id so the
    /// owner can run its removal path.
    ///
    /// Must be called from within a tokio runtime.
    pub fn supervise<F>(&self, handle: Arc<SubscriberHandle>, on_expire: F)
    where
        F: FnOnce(SubscriberId) + Send + 'static,
    {
        let token = handle.timers();
        tokio::spawn(run_heartbeat(
            Arc::clone(&handle),
            token.clone(),
            self.heartbeat_interval,
        ));
        tokio::spawn(run_lifetime(handle, token, self.max_lifetime, on_expire));
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_CONNECTION_LIFETIME)
    }
}

async fn run_heartbeat(handle: Arc<SubscriberHandle>, token: CancellationToken, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if !handle.is_open() {
                    break;
                }
                if handle.ping().is_err() {
                    // The transport is gone; its own close path will clean up.
                    break;
                }
            }
        }
    }
    log::trace!("Heartbeat stopped for {}", handle.id());
}

async fn run_lifetime<F>(
    handle: Arc<SubscriberHandle>,
    token: CancellationToken,
    max_lifetime: Duration,
    on_expire: F,
) where
    F: FnOnce(SubscriberId),
{
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = sleep(max_lifetime) => {
            log::info!(
                "Subscriber {} ({}) reached max lifetime of {}s, closing",
                handle.id(),
                handle.origin(),
                max_lifetime.as_secs()
            );
            let _ = handle.close_transport(CloseReason::LifetimeExpired);
            on_expire(handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::origin_admission::OriginAdmission;
    use crate::core::subscriber::{outbound_channel, Outbound, OutboundReceiver};
    use std::sync::Mutex;

    fn open_handle(admission: &Arc<OriginAdmission>) -> (Arc<SubscriberHandle>, OutboundReceiver) {
        let (tx, rx) = outbound_channel();
        let handle = Arc::new(SubscriberHandle::new(SubscriberId::new(1), "1.2.3.4", tx));
        handle.open(admission.acquire("1.2.3.4").expect("slot"));
        (handle, rx)
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_every_interval() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, mut rx) = open_handle(&admission);
        let supervisor = ConnectionSupervisor::new(Duration::from_secs(20), Duration::from_secs(3600));

        supervisor.supervise(Arc::clone(&handle), |_| {});

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(drain(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(42)).await;
        assert_eq!(drain(&mut rx), vec![Outbound::Ping, Outbound::Ping, Outbound::Ping]);

        handle.finish_close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_expiry_closes_and_reports() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, mut rx) = open_handle(&admission);
        let expired = Arc::new(Mutex::new(None));
        let supervisor = ConnectionSupervisor::new(Duration::from_secs(20), Duration::from_secs(30 * 60));

        let seen = Arc::clone(&expired);
        supervisor.supervise(Arc::clone(&handle), move |id| {
            *seen.lock().unwrap() = Some(id);
        });

        tokio::time::sleep(Duration::from_secs(30 * 60 - 1)).await;
        assert!(expired.lock().unwrap().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*expired.lock().unwrap(), Some(SubscriberId::new(1)));
        assert!(drain(&mut rx).contains(&Outbound::Close(CloseReason::LifetimeExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timers_stop_firing() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, mut rx) = open_handle(&admission);
        let expired = Arc::new(Mutex::new(false));
        let supervisor = ConnectionSupervisor::new(Duration::from_secs(20), Duration::from_secs(60));

        let seen = Arc::clone(&expired);
        supervisor.supervise(Arc::clone(&handle), move |_| {
            *seen.lock().unwrap() = true;
        });

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(drain(&mut rx), vec![Outbound::Ping]);

        handle.begin_close();
        handle.finish_close();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(!*expired.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_when_not_open() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, mut rx) = open_handle(&admission);
        let supervisor = ConnectionSupervisor::new(Duration::from_secs(20), Duration::from_secs(3600));

        supervisor.supervise(Arc::clone(&handle), |_| {});
        // Leave OPEN without cancelling the token: the heartbeat must notice on its own.
        handle.begin_close();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(drain(&mut rx).is_empty());
    }
}
