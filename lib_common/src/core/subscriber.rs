//! # Subscriber Handle
//!
//! The per-connection record owned by the [`SubscriberRegistry`](crate::core::SubscriberRegistry).
//! A handle knows who the subscriber is (id and origin), how to reach it (the sending half of its
//! outbound channel), where it is in its lifecycle, and which resources it holds: the origin slot
//! and the cancellation token shared by its heartbeat and lifetime timers.
//!
//! ## Lifecycle
//!
//! ```text
//! CONNECTING ──admit ok──▶ OPEN ──close initiated──▶ CLOSING ──cleanup──▶ CLOSED
//!      │                                                                    ▲
//!      └────────────────────────── admission rejected ──────────────────────┘
//! ```
//!
//! Transitions are compare-and-swap on an atomic state byte, so only one caller ever wins the
//! OPEN → CLOSING edge and runs cleanup.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::RelayError;
use crate::core::origin_admission::OriginSlot;

/// Opaque identity of one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Wraps a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle state of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriberState {
    /// Transport accepted, admission not yet decided.
    Connecting = 0,
    /// Admitted and eligible for broadcasts.
    Open = 1,
    /// Close initiated; cleanup in progress.
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl SubscriberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// # Close Reason
///
/// Server-initiated close causes that are reported to the peer. Each maps onto a WebSocket close
/// code so clients can tell an admission refusal apart from a lifetime expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The origin already holds its ceiling of open connections.
    AdmissionRejected,
    /// The connection reached its maximum lifetime.
    LifetimeExpired,
    /// The process is shutting down.
    ServerShutdown,
}

impl CloseReason {
    /// WebSocket close code sent with this reason.
    pub const fn code(self) -> u16 {
        match self {
            Self::AdmissionRejected => 4001,
            Self::LifetimeExpired => 4002,
            Self::ServerShutdown => 1001,
        }
    }

    /// Human-readable close reason sent with the code.
    pub const fn reason(self) -> &'static str {
        match self {
            Self::AdmissionRejected => "Too many connections from same IP",
            Self::LifetimeExpired => "Max duration reached",
            Self::ServerShutdown => "Server shutting down",
        }
    }
}

/// Why a subscriber left the OPEN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading from or writing to the transport failed.
    TransportError,
    /// The lifetime timer fired.
    LifetimeExpired,
    /// The server is shutting down.
    ServerShutdown,
}

/// A frame queued for a subscriber's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A broadcast payload, written verbatim.
    Payload(Arc<str>),
    /// A liveness probe.
    Ping,
    /// Close the transport with the given reason.
    Close(CloseReason),
}

/// Sending half of a subscriber's outbound channel.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
/// Receiving half of a subscriber's outbound channel, drained by the transport writer.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Creates the channel that connects a subscriber handle to its transport writer.
///
/// The channel is unbounded so that queueing a frame never blocks the broadcaster; a stalled
/// transport only grows its own queue.
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// # Subscriber Handle
///
/// See the module docs for the lifecycle. Handles are shared as `Arc<SubscriberHandle>` between
/// the registry, the broadcaster's snapshot and the supervisor's timer tasks.
#[derive(Debug)]
pub struct SubscriberHandle {
    id: SubscriberId,
    origin: String,
    state: AtomicU8,
    created_at: Instant,
    sender: OutboundSender,
    timers: CancellationToken,
    slot: Mutex<Option<OriginSlot>>,
}

impl SubscriberHandle {
    pub(crate) fn new(id: SubscriberId, origin: &str, sender: OutboundSender) -> Self {
        Self {
            id,
            origin: origin.to_string(),
            state: AtomicU8::new(SubscriberState::Connecting as u8),
            created_at: Instant::now(),
            sender,
            timers: CancellationToken::new(),
            slot: Mutex::new(None),
        }
    }

    /// The subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The subscriber's network origin.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the subscriber is OPEN.
    pub fn is_open(&self) -> bool {
        self.state() == SubscriberState::Open
    }

    /// When the handle was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How long the handle has existed.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Token shared by this subscriber's heartbeat and lifetime timers.
    pub(crate) fn timers(&self) -> CancellationToken {
        self.timers.clone()
    }

    /// A token that is cancelled once the subscriber has been removed (or rejected, or dropped).
    ///
    /// The transport watches it to tear the socket down even when the peer has stopped reading.
    /// Cancelling the returned token has no effect on the subscriber.
    pub fn teardown_signal(&self) -> CancellationToken {
        self.timers.child_token()
    }

    /// Stores the origin slot and moves CONNECTING → OPEN.
    pub(crate) fn open(&self, slot: OriginSlot) -> bool {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(slot);
        self.transition(SubscriberState::Connecting, SubscriberState::Open)
    }

    /// Moves a handle that was never admitted straight to CLOSED.
    pub(crate) fn reject(&self) {
        self.state.store(SubscriberState::Closed as u8, Ordering::Release);
        self.timers.cancel();
    }

    /// Moves CONNECTING or OPEN → CLOSING. Returns `false` if another caller got there first.
    pub(crate) fn begin_close(&self) -> bool {
        self.transition(SubscriberState::Open, SubscriberState::Closing)
            || self.transition(SubscriberState::Connecting, SubscriberState::Closing)
    }

    /// Cancels both timers, releases the origin slot and marks the handle CLOSED.
    pub(crate) fn finish_close(&self) {
        self.timers.cancel();
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        // Dropping the slot is the one and only release of this subscriber's origin.
        drop(slot);
        self.state.store(SubscriberState::Closed as u8, Ordering::Release);
    }

    fn transition(&self, from: SubscriberState, to: SubscriberState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn push(&self, outbound: Outbound) -> Result<(), RelayError> {
        self.sender
            .send(outbound)
            .map_err(|_| RelayError::TransportClosed { id: self.id })
    }

    /// Queues a payload for the transport. Never blocks.
    pub fn send(&self, payload: Arc<str>) -> Result<(), RelayError> {
        self.push(Outbound::Payload(payload))
    }

    /// Queues a liveness probe.
    pub fn ping(&self) -> Result<(), RelayError> {
        self.push(Outbound::Ping)
    }

    /// Asks the transport to close with `reason`.
    pub fn close_transport(&self, reason: CloseReason) -> Result<(), RelayError> {
        self.push(Outbound::Close(reason))
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        // Any slot still held here is released by its own Drop.
        self.timers.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::origin_admission::OriginAdmission;

    fn handle() -> (SubscriberHandle, OutboundReceiver) {
        let (tx, rx) = outbound_channel();
        (SubscriberHandle::new(SubscriberId::new(7), "1.2.3.4", tx), rx)
    }

    #[test]
    fn test_close_codes_are_distinct() {
        assert_eq!(CloseReason::AdmissionRejected.code(), 4001);
        assert_eq!(CloseReason::LifetimeExpired.code(), 4002);
        assert_ne!(
            CloseReason::AdmissionRejected.reason(),
            CloseReason::LifetimeExpired.reason()
        );
    }

    #[test]
    fn test_lifecycle_transitions() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, _rx) = handle();
        assert_eq!(handle.state(), SubscriberState::Connecting);

        assert!(handle.open(admission.acquire("1.2.3.4").expect("slot")));
        assert!(handle.is_open());

        assert!(handle.begin_close());
        assert_eq!(handle.state(), SubscriberState::Closing);
        assert!(!handle.begin_close());

        handle.finish_close();
        assert_eq!(handle.state(), SubscriberState::Closed);
        assert!(handle.timers().is_cancelled());
        assert_eq!(admission.count("1.2.3.4"), 0);
    }

    #[test]
    fn test_finish_close_twice_releases_once() {
        let admission = Arc::new(OriginAdmission::new(2));
        let (handle, _rx) = handle();
        handle.open(admission.acquire("1.2.3.4").expect("slot"));
        let _other = admission.acquire("1.2.3.4").expect("second slot");

        handle.finish_close();
        handle.finish_close();

        assert_eq!(admission.count("1.2.3.4"), 1);
    }

    #[test]
    fn test_dropping_an_open_handle_releases_its_slot() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, _rx) = handle();
        handle.open(admission.acquire("1.2.3.4").expect("slot"));
        let token = handle.timers();

        drop(handle);

        assert_eq!(admission.count("1.2.3.4"), 0);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_teardown_signal_fires_on_close_only() {
        let admission = Arc::new(OriginAdmission::new(1));
        let (handle, _rx) = handle();
        handle.open(admission.acquire("1.2.3.4").expect("slot"));
        let teardown = handle.teardown_signal();

        // A transport cancelling its copy must not stop the subscriber's timers.
        handle.teardown_signal().cancel();
        assert!(!handle.timers().is_cancelled());
        assert!(!teardown.is_cancelled());

        handle.begin_close();
        handle.finish_close();

        assert!(teardown.is_cancelled());
    }

    #[test]
    fn test_send_queues_frames_in_order() {
        let (handle, mut rx) = handle();

        handle.send(Arc::from("note:1")).expect("send");
        handle.ping().expect("ping");
        handle.close_transport(CloseReason::LifetimeExpired).expect("close");

        assert_eq!(rx.try_recv().ok(), Some(Outbound::Payload(Arc::from("note:1"))));
        assert_eq!(rx.try_recv().ok(), Some(Outbound::Ping));
        assert_eq!(
            rx.try_recv().ok(),
            Some(Outbound::Close(CloseReason::LifetimeExpired))
        );
    }

    #[test]
    fn test_send_to_dropped_transport_fails() {
        let (handle, rx) = handle();
        drop(rx);

        let err = handle.send(Arc::from("x")).expect_err("receiver is gone");
        assert!(matches!(err, RelayError::TransportClosed { id } if id == SubscriberId::new(7)));
    }

    #[test]
    fn test_display_id() {
        assert_eq!(SubscriberId::new(42).to_string(), "sub-42");
    }
}
