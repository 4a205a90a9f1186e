use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::bag::{BagItem, STATE_NOT_IN_USE};

/// Lifetimes above this get a randomized negative variance so a burst of
/// connections created together does not expire together.
const LIFETIME_VARIANCE_FLOOR_MS: u64 = 10_000;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Bookkeeping wrapper around one raw connection.
///
/// The connection itself is taken out of the entry while leased or being
/// torn down; the atomic state cell is the only synchronization between
/// borrowers, releasers and housekeeping. Timestamps are milliseconds from
/// the pool clock and are written only by whichever party owns the entry.
pub(crate) struct PoolEntry<C> {
    id: u64,
    conn: Mutex<Option<C>>,
    state: AtomicI32,
    evict: AtomicBool,
    created_at: u64,
    end_of_life: Option<u64>,
    last_accessed: AtomicU64,
    last_open: AtomicU64,
}

impl<C: Send + 'static> PoolEntry<C> {
    pub(crate) fn new(conn: C, now: u64, max_lifetime: Option<Duration>) -> PoolEntry<C> {
        let end_of_life = max_lifetime.map(|lifetime| {
            let lifetime = lifetime.as_millis() as u64;
            let variance = if lifetime > LIFETIME_VARIANCE_FLOOR_MS {
                rand::rng().random_range(0..lifetime / 40)
            } else {
                0
            };
            now + lifetime - variance
        });

        PoolEntry {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            conn: Mutex::new(Some(conn)),
            state: AtomicI32::new(STATE_NOT_IN_USE),
            evict: AtomicBool::new(false),
            created_at: now,
            end_of_life,
            last_accessed: AtomicU64::new(now),
            last_open: AtomicU64::new(now),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Takes the raw connection out of the entry. The caller must hold the
    /// entry in `IN_USE` or `RESERVED`.
    pub(crate) fn take_conn(&self) -> Option<C> {
        self.conn.lock().take()
    }

    pub(crate) fn put_conn(&self, conn: C) {
        *self.conn.lock() = Some(conn);
    }

    pub(crate) fn mark_evicted(&self) {
        self.evict.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_marked_evicted(&self) -> bool {
        self.evict.load(Ordering::SeqCst)
    }

    pub(crate) fn is_expired(&self, now: u64) -> bool {
        self.end_of_life.is_some_and(|end| now >= end)
    }

    pub(crate) fn created_at(&self) -> u64 {
        self.created_at
    }

    pub(crate) fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_accessed(&self, now: u64) {
        self.last_accessed.store(now, Ordering::SeqCst);
    }

    pub(crate) fn last_open(&self) -> u64 {
        self.last_open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_open(&self, now: u64) {
        self.last_open.store(now, Ordering::SeqCst);
    }
}

impl<C: Send + 'static> BagItem for PoolEntry<C> {
    fn state_cell(&self) -> &AtomicI32 {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::{STATE_IN_USE, STATE_REMOVED, STATE_RESERVED};

    #[test]
    fn lifetime_variance_stays_within_bounds() {
        for _ in 0..100 {
            let entry = PoolEntry::new((), 1000, Some(Duration::from_secs(60)));
            assert!(!entry.is_expired(1000 + 58_499));
            assert!(entry.is_expired(1000 + 60_000));
        }
    }

    #[test]
    fn short_lifetimes_have_no_variance() {
        let entry = PoolEntry::new((), 0, Some(Duration::from_millis(2000)));
        assert!(!entry.is_expired(1999));
        assert!(entry.is_expired(2000));
    }

    #[test]
    fn no_lifetime_never_expires() {
        let entry = PoolEntry::new((), 0, None);
        assert!(!entry.is_expired(u64::MAX));
    }

    #[test]
    fn state_transitions_follow_the_graph() {
        let entry = PoolEntry::new((), 0, None);

        // NOT_IN_USE -> IN_USE -> NOT_IN_USE
        assert!(entry.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE));
        assert!(!entry.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE));
        assert!(entry.compare_and_set(STATE_IN_USE, STATE_NOT_IN_USE));

        // NOT_IN_USE -> RESERVED -> NOT_IN_USE
        assert!(entry.compare_and_set(STATE_NOT_IN_USE, STATE_RESERVED));
        assert!(!entry.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE));
        assert!(entry.compare_and_set(STATE_RESERVED, STATE_NOT_IN_USE));

        // RESERVED -> REMOVED
        assert!(entry.compare_and_set(STATE_NOT_IN_USE, STATE_RESERVED));
        assert!(entry.compare_and_set(STATE_RESERVED, STATE_REMOVED));
        assert!(!entry.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE));
        assert_eq!(entry.state(), STATE_REMOVED);
    }

    #[test]
    fn connection_moves_in_and_out() {
        let entry = PoolEntry::new(42u32, 0, None);
        assert_eq!(entry.take_conn(), Some(42));
        assert_eq!(entry.take_conn(), None);
        entry.put_conn(7);
        assert_eq!(entry.take_conn(), Some(7));
    }
}
