//! # Relay
//!
//! Assembles the engine from a set of [`RelayLimits`]: one origin admission table, one rate
//! window, one registry and one broadcaster, all sharing the same state. Servers hold a single
//! `Arc<Relay>` and hand out bridges and registry access from it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::broadcaster::Broadcaster;
use crate::core::feed_bridge::FeedBridge;
use crate::core::origin_admission::{OriginAdmission, DEFAULT_MAX_CLIENTS_PER_ORIGIN};
use crate::core::rate_window::{RateWindow, ThrottlePolicy, DEFAULT_THROTTLE_WINDOW};
use crate::core::registry::SubscriberRegistry;
use crate::core::supervisor::{
    ConnectionSupervisor, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_CONNECTION_LIFETIME,
};

/// # Relay Limits
///
/// The numeric knobs of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Open connections allowed per origin.
    pub max_clients_per_origin: usize,
    /// Outbound throttling policy.
    pub throttle: ThrottlePolicy,
    /// Length of one throttle window.
    pub throttle_window: Duration,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Maximum lifetime of a connection.
    pub max_connection_lifetime: Duration,
}

impl Default for RelayLimits {
    /// 20 connections per origin, 100 messages per 60 s window, 20 s heartbeat, 30 min lifetime.
    fn default() -> Self {
        Self {
            max_clients_per_origin: DEFAULT_MAX_CLIENTS_PER_ORIGIN,
            throttle: ThrottlePolicy::default(),
            throttle_window: DEFAULT_THROTTLE_WINDOW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_connection_lifetime: DEFAULT_MAX_CONNECTION_LIFETIME,
        }
    }
}

/// # Relay
pub struct Relay {
    limits: RelayLimits,
    registry: Arc<SubscriberRegistry>,
    broadcaster: Arc<Broadcaster>,
}

impl Relay {
    /// Builds the engine.
    pub fn new(limits: RelayLimits) -> Self {
        let admission = Arc::new(OriginAdmission::new(limits.max_clients_per_origin));
        let rate_window = Arc::new(RateWindow::new(limits.throttle, limits.throttle_window));
        let supervisor =
            ConnectionSupervisor::new(limits.heartbeat_interval, limits.max_connection_lifetime);
        let registry = Arc::new(SubscriberRegistry::new(
            admission,
            Arc::clone(&rate_window),
            supervisor,
        ));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), rate_window));

        Self {
            limits,
            registry,
            broadcaster,
        }
    }

    /// The limits this relay was built with.
    pub fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    /// The subscriber registry.
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// The broadcaster.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The origin admission table.
    pub fn admission(&self) -> &Arc<OriginAdmission> {
        self.registry.admission()
    }

    /// The rate window.
    pub fn rate_window(&self) -> &Arc<RateWindow> {
        self.registry.rate_window()
    }

    /// A bridge relaying `channel` into this relay's broadcaster.
    pub fn bridge(&self, channel: impl Into<String>) -> FeedBridge {
        FeedBridge::new(channel, Arc::clone(&self.broadcaster))
    }

    /// Starts the rate window reset sweep. Returns `None` when throttling is disabled.
    pub fn spawn_rate_reset(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        match self.limits.throttle {
            ThrottlePolicy::Unlimited => None,
            ThrottlePolicy::PerWindow { .. } => Some(self.rate_window().spawn_reset_sweep(shutdown)),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = RelayLimits::default();
        assert_eq!(limits.max_clients_per_origin, 20);
        assert_eq!(limits.throttle, ThrottlePolicy::PerWindow { max_messages: 100 });
        assert_eq!(limits.throttle_window, Duration::from_secs(60));
        assert_eq!(limits.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(limits.max_connection_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_components_share_state() {
        let relay = Relay::new(RelayLimits {
            max_clients_per_origin: 3,
            ..RelayLimits::default()
        });

        assert_eq!(relay.admission().ceiling(), 3);
        assert!(Arc::ptr_eq(relay.broadcaster().registry(), relay.registry()));
        assert_eq!(relay.bridge("note_changes").channel(), "note_changes");
    }

    #[tokio::test]
    async fn test_no_sweep_when_unlimited() {
        let relay = Relay::new(RelayLimits {
            throttle: ThrottlePolicy::Unlimited,
            ..RelayLimits::default()
        });
        assert!(relay.spawn_rate_reset(CancellationToken::new()).is_none());
    }
}
