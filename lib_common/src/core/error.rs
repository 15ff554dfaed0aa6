//! # Relay Error Types

use thiserror::Error;

use crate::core::subscriber::SubscriberId;

/// Errors surfaced by the relay engine.
///
/// Throttled messages are not errors and never show up here; the broadcaster counts them in its
/// report and moves on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The origin already holds its ceiling of open connections.
    #[error("origin {origin} already holds {ceiling} open connections")]
    AdmissionRejected {
        /// The rejected origin.
        origin: String,
        /// The per-origin ceiling in force.
        ceiling: usize,
    },

    /// The subscriber's transport has gone away.
    #[error("transport for subscriber {id} is closed")]
    TransportClosed {
        /// The subscriber whose channel is closed.
        id: SubscriberId,
    },

    /// The upstream notification feed failed.
    #[cfg(feature = "connections")]
    #[error(transparent)]
    Feed(#[from] crate::connections::pg_listener::FeedError),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
