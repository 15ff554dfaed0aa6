//! # Per-Subscriber Rate Window
//!
//! Bounds how many broadcast payloads each subscriber can receive within one fixed window. The
//! check happens *before* the increment, so the ceiling is a hard upper bound: once a subscriber
//! has used its budget, further payloads in the same window are dropped for that subscriber only.
//!
//! A periodic sweep zeroes every counter at once. The counters live behind a single mutex, which
//! makes the sweep atomic with respect to concurrent `try_consume` calls: a caller sees either
//! the old window or the new one, never a half-reset map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::subscriber::SubscriberId;

/// Default per-window message ceiling.
pub const DEFAULT_MAX_MESSAGES_PER_WINDOW: u32 = 100;
/// Default window length.
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(60);

const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Whether, and how hard, outbound messages are throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlePolicy {
    /// Every payload is delivered.
    Unlimited,
    /// At most `max_messages` payloads per subscriber per window.
    PerWindow { max_messages: u32 },
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::PerWindow {
            max_messages: DEFAULT_MAX_MESSAGES_PER_WINDOW,
        }
    }
}

/// # Rate Window
#[derive(Debug)]
pub struct RateWindow {
    policy: ThrottlePolicy,
    window: Duration,
    counts: Mutex<HashMap<SubscriberId, u32>>,
}

impl RateWindow {
    /// Creates a rate window. Windows shorter than a millisecond are rounded up.
    pub fn new(policy: ThrottlePolicy, window: Duration) -> Self {
        Self {
            policy,
            window: window.max(MIN_WINDOW),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> ThrottlePolicy {
        self.policy
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<SubscriberId, u32>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Try Consume
    ///
    /// Returns `true` and counts the message if the subscriber is still under its ceiling for the
    /// current window; returns `false` and leaves the count unchanged otherwise.
    pub fn try_consume(&self, id: SubscriberId) -> bool {
        let max = match self.policy {
            ThrottlePolicy::Unlimited => return true,
            ThrottlePolicy::PerWindow { max_messages } => max_messages,
        };

        let mut counts = self.counts();
        let count = counts.entry(id).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Messages counted for `id` in the current window.
    pub fn count(&self, id: SubscriberId) -> u32 {
        self.counts().get(&id).copied().unwrap_or(0)
    }

    /// Starts a new window for every subscriber.
    pub fn reset(&self) {
        self.counts().clear();
    }

    /// Drops the entry of a subscriber that has gone away.
    pub fn forget(&self, id: SubscriberId) {
        self.counts().remove(&id);
    }

    /// Number of subscribers with a count in the current window.
    pub fn tracked(&self) -> usize {
        self.counts().len()
    }

    /// # Spawn Reset Sweep
    ///
    /// Spawns the task that calls [`reset`](Self::reset) once per window until `shutdown` is
    /// cancelled. The first reset happens one full window after the call.
    pub fn spawn_reset_sweep(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let rate_window = Arc::clone(self);
        tokio::spawn(async move {
            let period = rate_window.window;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        rate_window.reset();
                        log::trace!("Rate window reset");
                    }
                }
            }
            log::debug!("Rate window sweep stopped");
        })
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new(ThrottlePolicy::default(), DEFAULT_THROTTLE_WINDOW)
    }
}
