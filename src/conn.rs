use std::fmt;
use std::ops::{BitOr, BitOrAssign, Deref, DerefMut};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::entry::PoolEntry;
use crate::pool::PoolInner;
use crate::ManageConnection;

/// Connection session attributes a borrower changed away from the pool
/// default.
///
/// Adapters record which properties were touched while the connection was
/// out; the accumulated mask is handed to [`ManageConnection::reset`] before
/// the connection is reused, so untouched connections skip the reset
/// round-trip entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirty(u16);

impl Dirty {
    /// No attribute diverges from the pool default.
    pub const NONE: Dirty = Dirty(0);
    /// Auto-commit was toggled.
    pub const AUTO_COMMIT: Dirty = Dirty(1 << 0);
    /// The current catalog/database was changed.
    pub const CATALOG: Dirty = Dirty(1 << 1);
    /// Read-only mode was toggled.
    pub const READ_ONLY: Dirty = Dirty(1 << 2);
    /// The transaction isolation level was changed.
    pub const ISOLATION: Dirty = Dirty(1 << 3);
    /// The network timeout was changed.
    pub const NETWORK_TIMEOUT: Dirty = Dirty(1 << 4);

    /// Whether no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit in `other` is set in `self`.
    pub fn contains(self, other: Dirty) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Dirty {
    type Output = Dirty;

    fn bitor(self, rhs: Dirty) -> Dirty {
        Dirty(self.0 | rhs.0)
    }
}

impl BitOrAssign for Dirty {
    fn bitor_assign(&mut self, rhs: Dirty) {
        self.0 |= rhs.0;
    }
}

/// A smart pointer wrapping a pooled connection.
///
/// Dropping the guard is the user-visible close: the underlying connection
/// is reset if needed and returned to the pool rather than closed. The
/// borrow's leak timer, if armed, is cancelled on drop.
pub struct PooledConnection<M>
where
    M: ManageConnection,
{
    pool: Arc<PoolInner<M>>,
    entry: Arc<PoolEntry<M::Connection>>,
    conn: Option<M::Connection>,
    dirty: Dirty,
    leak_task: Option<JoinHandle<()>>,
}

impl<M> PooledConnection<M>
where
    M: ManageConnection,
{
    pub(crate) fn new(
        pool: Arc<PoolInner<M>>,
        entry: Arc<PoolEntry<M::Connection>>,
        conn: M::Connection,
        leak_task: Option<JoinHandle<()>>,
    ) -> PooledConnection<M> {
        PooledConnection {
            pool,
            entry,
            conn: Some(conn),
            dirty: Dirty::NONE,
            leak_task,
        }
    }

    /// Records session attributes that must be reset before this connection
    /// can be reused.
    pub fn mark_dirty(&mut self, bits: Dirty) {
        self.dirty |= bits;
    }

    /// Marks the underlying connection for eviction.
    ///
    /// The connection stays usable; it is closed instead of returned to the
    /// pool when this guard is dropped. Adapters call this when a driver
    /// error indicates the connection itself is dead.
    pub fn evict(&mut self) {
        self.entry.mark_evicted();
    }
}

impl<M> Deref for PooledConnection<M>
where
    M: ManageConnection,
{
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.conn.as_ref().unwrap()
    }
}

impl<M> DerefMut for PooledConnection<M>
where
    M: ManageConnection,
{
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().unwrap()
    }
}

impl<M> fmt::Debug for PooledConnection<M>
where
    M: ManageConnection,
    M::Connection: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.conn.as_ref().unwrap(), fmt)
    }
}

impl<M> Drop for PooledConnection<M>
where
    M: ManageConnection,
{
    fn drop(&mut self) {
        if let Some(task) = self.leak_task.take() {
            task.abort();
        }
        if let Some(conn) = self.conn.take() {
            self.pool.release(&self.entry, conn, self.dirty);
        }
    }
}
