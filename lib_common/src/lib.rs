//! # lib_common
//!
//! Shared library behind the note-change relay servers.
//!
//! - [`core`] (feature `core`): the relay engine. Per-origin admission, per-subscriber rate
//!   window, subscriber lifecycle and supervision, the registry, and the broadcaster that fans
//!   notification payloads out to every live subscriber.
//! - [`connections`] (feature `connections`): the upstream Postgres `LISTEN` feed.
//!
//! Transports stay outside this crate. A server accepts a connection, creates an
//! [`outbound_channel`](core::outbound_channel), admits it through the
//! [`SubscriberRegistry`](core::SubscriberRegistry), and drains the receiver onto its socket.

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;
