//! # Core Relay Engine
//!
//! This module is the heart of the note-change relay. It takes notifications from an upstream
//! feed and fans them out to live subscribers while keeping abusive or idle clients from
//! exhausting bandwidth or memory.
//!
//! ## Core Components:
//!
//! - **`origin_admission`**: Counts open connections per client origin and refuses new ones past
//!   a ceiling. Admissions are held as RAII slots so each one is released exactly once.
//!
//! - **`rate_window`**: Per-subscriber message budget for a fixed window, reset by a periodic
//!   sweep. Over-budget messages are dropped, never queued.
//!
//! - **`subscriber`**: The per-connection handle and its CONNECTING → OPEN → CLOSING → CLOSED
//!   state machine, plus the outbound frame channel a transport drains.
//!
//! - **`supervisor`**: Heartbeat pings and maximum-lifetime enforcement for each OPEN subscriber.
//!
//! - **`registry`**: The single owner of the subscriber set; every admission and removal goes
//!   through it.
//!
//! - **`broadcaster`**: Zero-copy fan-out of one payload to every OPEN, non-throttled subscriber.
//!
//! - **`feed_bridge`**: Drains upstream notification events into the broadcaster.
//!
//! - **`relay`**: Wires all of the above together from a single set of limits.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Relay error types.
pub mod error;
/// Per-origin connection ceiling.
pub mod origin_admission;
/// Per-subscriber message budget.
pub mod rate_window;
/// Per-connection handle and lifecycle.
pub mod subscriber;
/// Heartbeat and lifetime timers.
pub mod supervisor;
/// The live subscriber set.
pub mod registry;
/// Payload fan-out.
pub mod broadcaster;
/// Upstream feed to broadcaster glue.
pub mod feed_bridge;
/// Engine assembly.
pub mod relay;

// --- Public API Re-exports ---
pub use broadcaster::{BroadcastReport, Broadcaster};
pub use error::RelayError;
pub use feed_bridge::{EventReceiver, EventSender, FeedBridge, NotificationEvent, DEFAULT_NOTIFY_CHANNEL};
pub use origin_admission::{AdmissionStats, OriginAdmission, OriginSlot};
pub use rate_window::{RateWindow, ThrottlePolicy};
pub use registry::SubscriberRegistry;
pub use relay::{Relay, RelayLimits};
pub use subscriber::{
    outbound_channel, CloseCause, CloseReason, Outbound, OutboundReceiver, OutboundSender,
    SubscriberHandle, SubscriberId, SubscriberState,
};
pub use supervisor::ConnectionSupervisor;
