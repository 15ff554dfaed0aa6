//! # Fan-out Broadcaster
//!
//! The `Broadcaster` takes one notification payload and writes it to every eligible subscriber.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: The payload is wrapped in an `Arc<str>` once per broadcast. Every
//!     subscriber's queue receives a new pointer to the *same* allocation.
//!
//! 2.  **Snapshot Iteration**: The registry lock is held only long enough to clone the list of
//!     handles. Sends happen after the lock is released, so accept/close handlers and timer
//!     callbacks are never blocked behind a fan-out.
//!
//! 3.  **Throttle Before Send**: Each OPEN subscriber's [`RateWindow`] budget is consumed before
//!     the write. A subscriber over budget is skipped silently; the message is not queued for
//!     later.
//!
//! 4.  **Failure Isolation**: Sends are fire-and-forget onto each subscriber's unbounded queue.
//!     A failed send (the transport is already gone) is logged and counted, and the sweep moves
//!     on to the next subscriber.

use std::sync::Arc;

use crate::core::rate_window::RateWindow;
use crate::core::registry::SubscriberRegistry;
use crate::core::subscriber::SubscriberHandle;

/// # Broadcast Report
///
/// Outcome counters for one [`Broadcaster::broadcast`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers whose queue accepted the payload.
    pub delivered: usize,
    /// OPEN subscribers skipped because their window budget was spent.
    pub throttled: usize,
    /// Subscribers whose transport had already gone away.
    pub failed: usize,
    /// Registered subscribers that were not OPEN at the time of the sweep.
    pub skipped: usize,
}

/// # Broadcaster
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    rate_window: Arc<RateWindow>,
}

impl Broadcaster {
    /// Creates a broadcaster over `registry`, throttled by `rate_window`.
    pub fn new(registry: Arc<SubscriberRegistry>, rate_window: Arc<RateWindow>) -> Self {
        Self {
            registry,
            rate_window,
        }
    }

    /// # Broadcast
    ///
    /// Sweeps a snapshot of the registry and queues `payload`, verbatim, for every OPEN
    /// subscriber that is still within its window budget. The sweep always completes; no single
    /// subscriber can abort or delay it.
    pub fn broadcast(&self, payload: &str) -> BroadcastReport {
        let payload: Arc<str> = Arc::from(payload);
        let mut report = BroadcastReport::default();

        for subscriber in self.registry.snapshot() {
            if !subscriber.is_open() {
                report.skipped += 1;
                continue;
            }
            self.deliver_admitted(&subscriber, &payload, &mut report);
        }

        if report.throttled > 0 {
            log::debug!("Broadcast throttled for {} subscriber(s)", report.throttled);
        }
        report
    }

    /// Delivers to a subscriber that was OPEN when the sweep reached it.
    fn deliver_admitted(
        &self,
        subscriber: &SubscriberHandle,
        payload: &Arc<str>,
        report: &mut BroadcastReport,
    ) {
        if !self.rate_window.try_consume(subscriber.id()) {
            report.throttled += 1;
            return;
        }

        // Removed while we were counting: drop the counter we just created.
        if !subscriber.is_open() {
            self.rate_window.forget(subscriber.id());
            report.skipped += 1;
            return;
        }

        match subscriber.send(Arc::clone(payload)) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                log::warn!("Broadcast to {} ({}) failed: {}", subscriber.id(), subscriber.origin(), e);
                report.failed += 1;
            }
        }
    }

    /// The registry this broadcaster sweeps.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }
}
