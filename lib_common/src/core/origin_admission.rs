//! # Per-Origin Admission Control
//!
//! Tracks how many connections each network origin (the client's remote IP) currently holds
//! open and refuses new ones once that origin reaches its ceiling. This is the first line of
//! defence against a single host opening hundreds of sockets to soak up egress bandwidth.
//!
//! ## Slots
//!
//! A successful admission is represented by an [`OriginSlot`]. The slot owns the increment: when
//! it is dropped, the origin's counter is decremented. Because a slot can only be dropped once,
//! every admitted connection releases its origin exactly once, whichever path tears it down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default ceiling of simultaneously open connections per origin.
pub const DEFAULT_MAX_CLIENTS_PER_ORIGIN: usize = 20;

/// # Admission Statistics
///
/// Lifetime counters, mainly useful for diagnostics and for asserting that every admission was
/// paired with a release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Successful `try_admit` calls.
    pub admitted: u64,
    /// Refused `try_admit` calls.
    pub rejected: u64,
    /// `release` calls that actually decremented a counter.
    pub released: u64,
}

#[derive(Debug, Default)]
struct OriginBook {
    counts: HashMap<String, usize>,
    stats: AdmissionStats,
}

/// # Origin Admission
///
/// Mutex-guarded map of origin → open-connection count. Entries are pruned when they drop back
/// to zero so that one-off visitors do not accumulate forever.
#[derive(Debug)]
pub struct OriginAdmission {
    ceiling: usize,
    book: Mutex<OriginBook>,
}

impl OriginAdmission {
    /// Creates an admission controller allowing at most `ceiling` open connections per origin.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            book: Mutex::new(OriginBook::default()),
        }
    }

    /// The configured per-origin ceiling.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    fn book(&self) -> MutexGuard<'_, OriginBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Try Admit
    ///
    /// Increments the origin's counter and returns `true` if the count *before* the increment was
    /// strictly below the ceiling. Otherwise returns `false` and leaves the counter untouched.
    pub fn try_admit(&self, origin: &str) -> bool {
        let mut book = self.book();
        let current = book.counts.get(origin).copied().unwrap_or(0);

        if current >= self.ceiling {
            book.stats.rejected += 1;
            return false;
        }

        book.counts.insert(origin.to_string(), current + 1);
        book.stats.admitted += 1;
        true
    }

    /// # Release
    ///
    /// Decrements the origin's counter, floored at zero. Releasing an origin that holds no
    /// connections is a no-op, so a stray double release can never drive the count negative.
    pub fn release(&self, origin: &str) {
        let mut book = self.book();
        let Some(count) = book.counts.get_mut(origin) else {
            return;
        };

        *count = count.saturating_sub(1);
        if *count == 0 {
            book.counts.remove(origin);
        }
        book.stats.released += 1;
    }

    /// Admits `origin` and wraps the admission in a slot that releases it on drop.
    ///
    /// Returns `None` when the origin is already at its ceiling.
    pub fn acquire(self: &Arc<Self>, origin: &str) -> Option<OriginSlot> {
        if !self.try_admit(origin) {
            return None;
        }

        Some(OriginSlot {
            admission: Arc::clone(self),
            origin: origin.to_string(),
        })
    }

    /// Number of connections currently held by `origin`.
    pub fn count(&self, origin: &str) -> usize {
        self.book().counts.get(origin).copied().unwrap_or(0)
    }

    /// Number of connections currently held across all origins.
    pub fn total(&self) -> usize {
        self.book().counts.values().sum()
    }

    /// Number of distinct origins holding at least one connection.
    pub fn origins(&self) -> usize {
        self.book().counts.len()
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> AdmissionStats {
        self.book().stats
    }
}

impl Default for OriginAdmission {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS_PER_ORIGIN)
    }
}

/// # Origin Slot
///
/// One admitted connection's hold on its origin counter. Dropping the slot releases it.
#[derive(Debug)]
pub struct OriginSlot {
    admission: Arc<OriginAdmission>,
    origin: String,
}

impl OriginSlot {
    /// The origin this slot counts against.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Drop for OriginSlot {
    fn drop(&mut self) {
        self.admission.release(&self.origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_ceiling_then_rejects() {
        let admission = OriginAdmission::new(20);

        let admitted = (0..21).filter(|_| admission.try_admit("1.2.3.4")).count();

        assert_eq!(admitted, 20);
        assert_eq!(admission.count("1.2.3.4"), 20);
        assert_eq!(admission.stats().rejected, 1);
    }

    #[test]
    fn test_origins_are_counted_independently() {
        let admission = OriginAdmission::new(1);

        assert!(admission.try_admit("10.0.0.1"));
        assert!(admission.try_admit("10.0.0.2"));
        assert!(!admission.try_admit("10.0.0.1"));
        assert_eq!(admission.total(), 2);
        assert_eq!(admission.origins(), 2);
    }

    #[test]
    fn test_release_is_floored_at_zero() {
        let admission = OriginAdmission::new(5);
        assert!(admission.try_admit("a"));

        admission.release("a");
        admission.release("a");
        admission.release("never-seen");

        assert_eq!(admission.count("a"), 0);
        assert_eq!(admission.stats().released, 1);
        // The pruned entry can be admitted again from scratch.
        assert!(admission.try_admit("a"));
        assert_eq!(admission.count("a"), 1);
    }

    #[test]
    fn test_release_frees_a_slot_for_the_same_origin() {
        let admission = OriginAdmission::new(2);
        assert!(admission.try_admit("a"));
        assert!(admission.try_admit("a"));
        assert!(!admission.try_admit("a"));

        admission.release("a");

        assert!(admission.try_admit("a"));
    }

    #[test]
    fn test_zero_ceiling_rejects_everything() {
        let admission = OriginAdmission::new(0);
        assert!(!admission.try_admit("a"));
        assert_eq!(admission.count("a"), 0);
    }

    #[test]
    fn test_slot_releases_exactly_once_on_drop() {
        let admission = Arc::new(OriginAdmission::new(3));

        let first = admission.acquire("a").expect("first slot");
        let second = admission.acquire("a").expect("second slot");
        assert_eq!(first.origin(), "a");
        assert_eq!(admission.count("a"), 2);

        drop(first);
        assert_eq!(admission.count("a"), 1);
        drop(second);
        assert_eq!(admission.count("a"), 0);

        let stats = admission.stats();
        assert_eq!(stats.admitted, stats.released);
    }

    #[test]
    fn test_acquire_at_ceiling_returns_none() {
        let admission = Arc::new(OriginAdmission::new(1));
        let _held = admission.acquire("a").expect("slot");

        assert!(admission.acquire("a").is_none());
        assert_eq!(admission.count("a"), 1);
    }
}
