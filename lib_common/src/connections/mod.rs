//! # Connections Module
//!
//! Upstream connections that feed the relay engine.

/// PostgreSQL `LISTEN`/`NOTIFY` notification feed with reconnect backoff.
pub mod pg_listener;

pub use pg_listener::{
    keep_alive, FeedError, FeedExit, FeedSession, ListenSession, PgNotificationFeed, ReconnectBackoff,
};
