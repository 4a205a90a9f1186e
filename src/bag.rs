//! The concurrent handoff structure backing the pool.
//!
//! Items live in a shared list for as long as they are part of the pool and
//! move between states purely by compare-and-set, so a successful
//! `NOT_IN_USE -> IN_USE` transition is the linearization point of a borrow.
//! Releases prefer handing an item directly to a parked waiter over leaving
//! it to be rediscovered by scanning, and each thread keeps a small cache of
//! recently released items to skip the shared list entirely when load is low.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use futures::channel::oneshot;
use parking_lot::{Mutex, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

pub(crate) const STATE_NOT_IN_USE: i32 = 0;
pub(crate) const STATE_IN_USE: i32 = 1;
pub(crate) const STATE_REMOVED: i32 = -1;
pub(crate) const STATE_RESERVED: i32 = -2;

/// Number of weak references each releasing thread retains for reuse.
const LOCAL_CACHE_MAX: usize = 16;

/// Capability required of items stored in a [`ConcurrentBag`]: an atomic
/// state cell driven exclusively through compare-and-set.
///
/// State cells use sequentially consistent ordering throughout so that a
/// release's state store can never be reordered past its waiter-count check.
pub(crate) trait BagItem: Send + Sync + 'static {
    fn state_cell(&self) -> &AtomicI32;

    fn state(&self) -> i32 {
        self.state_cell().load(Ordering::SeqCst)
    }

    fn compare_and_set(&self, expected: i32, target: i32) -> bool {
        self.state_cell()
            .compare_exchange(expected, target, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set_state(&self, target: i32) {
        self.state_cell().store(target, Ordering::SeqCst);
    }
}

/// Returned by [`ConcurrentBag::borrow`] when the bag has been closed.
#[derive(Debug)]
pub(crate) struct BagClosed;

pub(crate) struct ConcurrentBag<T: BagItem> {
    shared: RwLock<Vec<Arc<T>>>,
    handoff: Mutex<VecDeque<oneshot::Sender<Arc<T>>>>,
    local: DashMap<ThreadId, Vec<Weak<T>>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    /// Invoked whenever a borrower is about to park, after its waiter count
    /// increment is visible. The pool hooks connection creation in here, so
    /// demand can never slip between a failed scan and the park.
    listener: Box<dyn Fn() + Send + Sync>,
}

impl<T: BagItem> ConcurrentBag<T> {
    pub(crate) fn new(listener: Box<dyn Fn() + Send + Sync>) -> ConcurrentBag<T> {
        ConcurrentBag {
            shared: RwLock::new(Vec::new()),
            handoff: Mutex::new(VecDeque::new()),
            local: DashMap::new(),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            listener,
        }
    }

    /// Inserts a new item and offers it to a parked waiter if there is one.
    pub(crate) fn add(&self, item: Arc<T>) {
        self.shared.write().push(Arc::clone(&item));
        self.notify_waiter(&item);
    }

    /// Acquires an item, waiting up to `timeout` for one to become free.
    ///
    /// Returns `Ok(None)` on deadline expiry and `Err(BagClosed)` once
    /// [`close`](Self::close) has run.
    pub(crate) async fn borrow(&self, timeout: Duration) -> Result<Option<Arc<T>>, BagClosed> {
        if let Some(item) = self.take_cached() {
            return Ok(Some(item));
        }

        let deadline = Instant::now() + timeout;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaiterGuard(&self.waiters);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BagClosed);
            }
            if let Some(item) = self.scan() {
                return Ok(Some(item));
            }

            let (tx, rx) = oneshot::channel();
            self.handoff.lock().push_back(tx);
            // An item released between the scan above and the channel
            // registration would otherwise go unnoticed until the deadline.
            if let Some(item) = self.scan() {
                return Ok(Some(item));
            }
            (self.listener)();

            match timeout_at(deadline, rx).await {
                Ok(Ok(item)) => {
                    if item.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE) {
                        return Ok(Some(item));
                    }
                    // Lost the race to a scanning borrower; keep waiting.
                }
                Ok(Err(_canceled)) => {
                    // Sender dropped, typically during close. The loop
                    // re-checks the closed flag before parking again.
                }
                Err(_elapsed) => return Ok(None),
            }
        }
    }

    /// Returns a borrowed item to the bag.
    ///
    /// The caller must own the item in `IN_USE`; the state store publishes
    /// every write the releaser made to it.
    pub(crate) fn requite(&self, item: &Arc<T>) {
        item.set_state(STATE_NOT_IN_USE);

        {
            let mut cached = self.local.entry(thread::current().id()).or_default();
            if cached.len() >= LOCAL_CACHE_MAX {
                cached.remove(0);
            }
            cached.push(Arc::downgrade(item));
        }

        self.notify_waiter(item);
    }

    /// Attempts to claim a free item on behalf of housekeeping.
    pub(crate) fn reserve(&self, item: &Arc<T>) -> bool {
        item.compare_and_set(STATE_NOT_IN_USE, STATE_RESERVED)
    }

    /// Aborts a reservation, making the item borrowable again.
    pub(crate) fn unreserve(&self, item: &Arc<T>) {
        if item.compare_and_set(STATE_RESERVED, STATE_NOT_IN_USE) {
            self.notify_waiter(item);
        }
    }

    /// Removes an item the caller holds in `IN_USE` or `RESERVED`.
    pub(crate) fn remove(&self, item: &Arc<T>) {
        if !item.compare_and_set(STATE_IN_USE, STATE_REMOVED)
            && !item.compare_and_set(STATE_RESERVED, STATE_REMOVED)
            && !self.closed.load(Ordering::SeqCst)
        {
            warn!("attempt to remove an item not borrowed or reserved");
        }
        self.shared.write().retain(|other| !Arc::ptr_eq(other, item));
    }

    /// Snapshot of every item currently in the bag, for housekeeping scans.
    pub(crate) fn values(&self) -> Vec<Arc<T>> {
        self.shared.read().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub(crate) fn count(&self, state: i32) -> usize {
        self.shared
            .read()
            .iter()
            .filter(|item| item.state() == state)
            .count()
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Rejects future borrows and wakes every parked waiter.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders cancels the receivers, so parked borrowers
        // wake and observe the closed flag.
        self.handoff.lock().clear();
    }

    fn take_cached(&self) -> Option<Arc<T>> {
        let mut cached = self.local.get_mut(&thread::current().id())?;
        while let Some(weak) = cached.pop() {
            if let Some(item) = weak.upgrade() {
                if item.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE) {
                    return Some(item);
                }
            }
        }
        None
    }

    fn scan(&self) -> Option<Arc<T>> {
        let shared = self.shared.read();
        for item in shared.iter() {
            if item.compare_and_set(STATE_NOT_IN_USE, STATE_IN_USE) {
                return Some(Arc::clone(item));
            }
        }
        None
    }

    fn notify_waiter(&self, item: &Arc<T>) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut handoff = self.handoff.lock();
        while let Some(tx) = handoff.pop_front() {
            // The item stays NOT_IN_USE until the receiving waiter wins the
            // compare-and-set, so a dead or outraced waiter loses nothing.
            if tx.send(Arc::clone(item)).is_ok() {
                return;
            }
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
