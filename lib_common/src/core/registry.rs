//! # Subscriber Registry
//!
//! Single owner of the live subscriber set. Admission and removal both go through here, which
//! makes this the choke point for the origin and rate-window bookkeeping: a subscriber enters the
//! map only holding an origin slot, and leaves it exactly once, releasing that slot and
//! cancelling its timers on the way out.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::error::RelayError;
use crate::core::origin_admission::OriginAdmission;
use crate::core::rate_window::RateWindow;
use crate::core::subscriber::{
    CloseCause, CloseReason, OutboundSender, SubscriberHandle, SubscriberId,
};
use crate::core::supervisor::ConnectionSupervisor;

/// Live subscribers keyed by id.
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<SubscriberId, Arc<SubscriberHandle>>>,
    admission: Arc<OriginAdmission>,
    rate_window: Arc<RateWindow>,
    supervisor: ConnectionSupervisor,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new(
        admission: Arc<OriginAdmission>,
        rate_window: Arc<RateWindow>,
        supervisor: ConnectionSupervisor,
    ) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            admission,
            rate_window,
            supervisor,
            next_id: AtomicU64::new(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<SubscriberHandle>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a freshly accepted transport from `origin`.
    ///
    /// On success the subscriber is OPEN, registered, and supervised. When the origin is at its
    /// ceiling a `Close(AdmissionRejected)` frame is queued on `sender` and nothing is registered.
    pub fn admit(
        self: &Arc<Self>,
        origin: &str,
        sender: OutboundSender,
    ) -> Result<Arc<SubscriberHandle>, RelayError> {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(SubscriberHandle::new(id, origin, sender));

        let Some(slot) = self.admission.acquire(origin) else {
            log::warn!(
                "Rejecting {} from {}: too many connections (ceiling {})",
                id,
                origin,
                self.admission.ceiling()
            );
            let _ = handle.close_transport(CloseReason::AdmissionRejected);
            handle.reject();
            return Err(RelayError::AdmissionRejected {
                origin: origin.to_string(),
                ceiling: self.admission.ceiling(),
            });
        };

        handle.open(slot);
        self.subscribers().insert(id, Arc::clone(&handle));

        let registry = Arc::downgrade(self);
        self.supervisor.supervise(Arc::clone(&handle), move |id| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id, CloseCause::LifetimeExpired);
            }
        });

        log::info!("Client connected ({}) as {}", origin, id);
        Ok(handle)
    }

    /// Removes a subscriber. Safe to call any number of times: only the first call for a given
    /// id has an effect, and only that call returns `true`.
    pub fn remove(&self, id: SubscriberId, cause: CloseCause) -> bool {
        // Detach under the lock, clean up outside it.
        let Some(handle) = self.subscribers().remove(&id) else {
            return false;
        };

        handle.begin_close();
        handle.finish_close();
        // After the state change, so a sweep that already passed its OPEN check cleans up after
        // itself instead of leaving a counter behind.
        self.rate_window.forget(id);

        log::info!(
            "Client disconnected ({}) {} after {}s: {:?}",
            handle.origin(),
            id,
            handle.age().as_secs(),
            cause
        );
        true
    }

    /// Asks the subscriber's transport to close with `reason`, then removes it.
    pub fn close(&self, id: SubscriberId, reason: CloseReason, cause: CloseCause) -> bool {
        match self.get(id) {
            Some(handle) => {
                let _ = handle.close_transport(reason);
                self.remove(id, cause)
            }
            None => false,
        }
    }

    /// Closes every subscriber with [`CloseReason::ServerShutdown`]. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<SubscriberId> = self.subscribers().keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if self.close(id, CloseReason::ServerShutdown, CloseCause::ServerShutdown) {
                closed += 1;
            }
        }
        closed
    }

    /// Clones the current set of handles so callers can iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<SubscriberHandle>> {
        self.subscribers().values().cloned().collect()
    }

    /// Looks up an OPEN or CLOSING subscriber.
    pub fn get(&self, id: SubscriberId) -> Option<Arc<SubscriberHandle>> {
        self.subscribers().get(&id).cloned()
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    /// Whether no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers().is_empty()
    }

    /// The origin admission table.
    pub fn admission(&self) -> &Arc<OriginAdmission> {
        &self.admission
    }

    /// The rate window.
    pub fn rate_window(&self) -> &Arc<RateWindow> {
        &self.rate_window
    }

    /// The supervisor policy applied to new subscribers.
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subscriber::{outbound_channel, Outbound, OutboundReceiver, SubscriberState};
    use std::time::Duration;

    fn registry(ceiling: usize) -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new(
            Arc::new(OriginAdmission::new(ceiling)),
            Arc::new(RateWindow::default()),
            ConnectionSupervisor::default(),
        ))
    }

    fn connect(
        registry: &Arc<SubscriberRegistry>,
        origin: &str,
    ) -> (Result<Arc<SubscriberHandle>, RelayError>, OutboundReceiver) {
        let (tx, rx) = outbound_channel();
        (registry.admit(origin, tx), rx)
    }

    #[tokio::test]
    async fn test_twenty_first_connection_is_rejected() {
        let registry = registry(20);
        let mut open = Vec::new();

        for _ in 0..20 {
            let (handle, rx) = connect(&registry, "1.2.3.4");
            open.push((handle.expect("admitted"), rx));
        }
        let (rejected, mut rx) = connect(&registry, "1.2.3.4");

        assert!(matches!(
            rejected,
            Err(RelayError::AdmissionRejected { ceiling: 20, .. })
        ));
        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Close(CloseReason::AdmissionRejected))
        );
        assert_eq!(registry.len(), 20);
        assert!(open.iter().all(|(handle, _)| handle.is_open()));
        assert_eq!(registry.admission().count("1.2.3.4"), 20);
    }

    #[tokio::test]
    async fn test_remove_twice_releases_once() {
        let registry = registry(20);
        let (first, _rx1) = connect(&registry, "1.2.3.4");
        let (_second, _rx2) = connect(&registry, "1.2.3.4");
        let first = first.expect("admitted");

        assert!(registry.remove(first.id(), CloseCause::PeerClosed));
        assert!(!registry.remove(first.id(), CloseCause::TransportError));

        assert_eq!(registry.admission().count("1.2.3.4"), 1);
        assert_eq!(first.state(), SubscriberState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_forgets_rate_counter() {
        let registry = registry(20);
        let (handle, _rx) = connect(&registry, "1.2.3.4");
        let handle = handle.expect("admitted");
        registry.rate_window().try_consume(handle.id());

        registry.remove(handle.id(), CloseCause::PeerClosed);

        assert_eq!(registry.rate_window().tracked(), 0);
    }

    #[tokio::test]
    async fn test_close_queues_reason_then_removes() {
        let registry = registry(20);
        let (handle, mut rx) = connect(&registry, "1.2.3.4");
        let id = handle.expect("admitted").id();

        assert!(registry.close(id, CloseReason::ServerShutdown, CloseCause::ServerShutdown));
        assert!(!registry.close(id, CloseReason::ServerShutdown, CloseCause::ServerShutdown));

        assert_eq!(rx.try_recv().ok(), Some(Outbound::Close(CloseReason::ServerShutdown)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everyone() {
        let registry = registry(20);
        let mut receivers = Vec::new();
        for origin in ["a", "b", "b"] {
            let (handle, rx) = connect(&registry, origin);
            handle.expect("admitted");
            receivers.push(rx);
        }

        assert_eq!(registry.shutdown(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.admission().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_expiry_removes_and_releases() {
        let registry = Arc::new(SubscriberRegistry::new(
            Arc::new(OriginAdmission::new(20)),
            Arc::new(RateWindow::default()),
            ConnectionSupervisor::new(Duration::from_secs(20), Duration::from_secs(30 * 60)),
        ));
        let (handle, mut rx) = connect(&registry, "1.2.3.4");
        let handle = handle.expect("admitted");

        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;

        assert!(registry.is_empty());
        assert_eq!(handle.state(), SubscriberState::Closed);
        assert_eq!(registry.admission().count("1.2.3.4"), 0);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.last(), Some(&Outbound::Close(CloseReason::LifetimeExpired)));

        let stats = registry.admission().stats();
        assert_eq!(stats.admitted, stats.released);
    }

    #[tokio::test]
    async fn test_release_count_matches_admissions_across_exit_paths() {
        let registry = registry(2);
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for origin in ["a", "a", "a", "b"] {
            let (handle, rx) = connect(&registry, origin);
            if let Ok(handle) = handle {
                ids.push(handle.id());
            }
            receivers.push(rx);
        }

        registry.remove(ids[0], CloseCause::PeerClosed);
        registry.remove(ids[0], CloseCause::PeerClosed);
        registry.close(ids[1], CloseReason::LifetimeExpired, CloseCause::LifetimeExpired);
        registry.remove(ids[2], CloseCause::TransportError);

        let stats = registry.admission().stats();
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.released, 3);
        assert_eq!(registry.admission().total(), 0);
    }
}
