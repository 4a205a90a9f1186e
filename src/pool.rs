use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::bag::{BagClosed, BagItem, ConcurrentBag, STATE_IN_USE, STATE_NOT_IN_USE};
use crate::clock::Clock;
use crate::config::{Builder, Config};
use crate::conn::{Dirty, PooledConnection};
use crate::entry::PoolEntry;
use crate::error::{PoolError, SuspensionDisabled};
use crate::housekeeper;
use crate::ManageConnection;

/// First retry delay after a failed connection creation.
const CREATE_BACKOFF_FLOOR: Duration = Duration::from_millis(200);
/// Upper bound on the delay between creation attempts.
const CREATE_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Information about the state of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    /// Connections currently managed by the pool.
    pub total: u32,
    /// Connections currently checked out.
    pub active: u32,
    /// Connections sitting idle in the pool.
    pub idle: u32,
    /// Callers currently blocked waiting for a connection.
    pub waiting: u32,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "total={}, active={}, idle={}, waiting={}",
            self.total, self.active, self.idle, self.waiting
        )
    }
}

/// A connection returned to the pool with session state to reset first.
struct Recycle<C> {
    entry: Arc<PoolEntry<C>>,
    conn: C,
    dirty: Dirty,
}

pub(crate) struct PoolInner<M>
where
    M: ManageConnection,
{
    pub(crate) config: Config,
    pub(crate) manager: M,
    pub(crate) bag: ConcurrentBag<PoolEntry<M::Connection>>,
    pub(crate) clock: Clock,
    closed: AtomicBool,
    pending_creates: AtomicU32,
    last_connect_error: Mutex<Option<Arc<M::Error>>>,
    demand_tx: mpsc::Sender<()>,
    demand_rx: Mutex<Option<mpsc::Receiver<()>>>,
    recycle_tx: mpsc::UnboundedSender<Recycle<M::Connection>>,
    recycle_rx: Mutex<Option<mpsc::UnboundedReceiver<Recycle<M::Connection>>>>,
    suspend_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<M> PoolInner<M>
where
    M: ManageConnection,
{
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> State {
        let entries = self.bag.values();
        let total = entries.len() as u32;
        let active = entries
            .iter()
            .filter(|entry| entry.state() == STATE_IN_USE)
            .count() as u32;
        let idle = entries
            .iter()
            .filter(|entry| entry.state() == STATE_NOT_IN_USE)
            .count() as u32;
        State {
            total,
            active,
            idle,
            waiting: self.bag.waiting_count() as u32,
        }
    }

    /// Nudges the creator task; coalesces with any signal already pending.
    pub(crate) fn signal_demand(&self) {
        let _ = self.demand_tx.try_send(());
    }

    fn needs_connection(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let total = self.bag.len() as u32 + self.pending_creates.load(Ordering::SeqCst);
        if total >= self.config.max_size {
            return false;
        }
        let idle = self.bag.count(STATE_NOT_IN_USE) as u32;
        idle < self.config.min_idle || self.bag.waiting_count() as u32 > idle
    }

    async fn create_entry(&self) -> Result<Arc<PoolEntry<M::Connection>>, M::Error> {
        let mut conn = self.manager.connect().await?;
        self.manager.on_create(&mut conn).await?;
        let entry = Arc::new(PoolEntry::new(
            conn,
            self.clock.now_millis(),
            self.config.max_lifetime,
        ));
        debug!(id = entry.id(), "added connection to the pool");
        Ok(entry)
    }

    /// Runs the aliveness probe against a borrowed entry, bounded by the
    /// validation timeout. The connection is back inside the entry when this
    /// returns.
    async fn validate(&self, entry: &Arc<PoolEntry<M::Connection>>) -> bool {
        let Some(mut conn) = entry.take_conn() else {
            return false;
        };
        let deadline = Instant::now() + self.config.validation_timeout;
        let valid = match timeout_at(deadline, self.manager.is_valid(&mut conn)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!(id = entry.id(), error = %err, "aliveness check failed");
                false
            }
            Err(_elapsed) => {
                debug!(id = entry.id(), "aliveness check timed out");
                false
            }
        };
        entry.put_conn(conn);
        valid
    }

    /// Closes an entry the caller holds in `IN_USE`.
    fn close_borrowed(&self, entry: &Arc<PoolEntry<M::Connection>>, reason: &str) {
        debug!(id = entry.id(), reason, "closing connection");
        self.bag.remove(entry);
        drop(entry.take_conn());
        self.signal_demand();
    }

    /// Closes an entry the caller has reserved.
    pub(crate) fn close_reserved(&self, entry: &Arc<PoolEntry<M::Connection>>, reason: &str) {
        debug!(id = entry.id(), reason, "closing connection");
        self.bag.remove(entry);
        drop(entry.take_conn());
    }

    /// Marks every entry for eviction and immediately closes the ones not in
    /// use. In-flight borrowers are not interrupted.
    pub(crate) fn soft_evict_all(&self) {
        for entry in self.bag.values() {
            entry.mark_evicted();
            if self.bag.reserve(&entry) {
                self.close_reserved(&entry, "soft eviction");
            }
        }
        self.signal_demand();
    }

    pub(crate) fn release(
        &self,
        entry: &Arc<PoolEntry<M::Connection>>,
        mut conn: M::Connection,
        dirty: Dirty,
    ) {
        let now = self.clock.now_millis();
        entry.set_last_accessed(now);

        let broken = self.manager.has_broken(&mut conn);
        if broken || entry.is_marked_evicted() || entry.is_expired(now) || self.is_closed() {
            if broken {
                warn!(id = entry.id(), "connection returned broken, discarding");
            } else {
                let age_ms = now.saturating_sub(entry.created_at());
                debug!(id = entry.id(), age_ms, "closing connection on release");
            }
            self.bag.remove(entry);
            drop(conn);
            self.signal_demand();
        } else if !dirty.is_empty() {
            let recycle = Recycle {
                entry: Arc::clone(entry),
                conn,
                dirty,
            };
            if let Err(send_error) = self.recycle_tx.send(recycle) {
                // The recycler is gone, so the pool is tearing down.
                let Recycle { entry, conn, .. } = send_error.0;
                self.bag.remove(&entry);
                drop(conn);
            }
        } else {
            entry.put_conn(conn);
            self.bag.requite(entry);
        }
    }

    fn spawn_leak_task(
        &self,
        entry: &Arc<PoolEntry<M::Connection>>,
    ) -> Option<JoinHandle<()>> {
        let threshold = self.config.leak_detection_threshold?;
        let backtrace = Backtrace::force_capture();
        let clock = self.clock;
        let entry = Arc::clone(entry);
        Some(tokio::spawn(async move {
            sleep(threshold).await;
            let held_ms = clock.now_millis().saturating_sub(entry.last_open());
            warn!(
                id = entry.id(),
                held_ms, "apparent connection leak detected; borrowed at:\n{backtrace}"
            );
        }))
    }

    /// Blocks while the pool is suspended, up to the acquisition deadline.
    async fn wait_if_suspended(&self, deadline: Instant) -> Result<(), PoolError<M::Error>> {
        if !*self.suspend_tx.borrow() {
            return Ok(());
        }
        let mut rx = self.suspend_tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => return Ok(()),
                Err(_elapsed) => return Err(PoolError::Suspended),
            }
        }
    }

    fn acquire_timeout_error(&self) -> PoolError<M::Error> {
        if self.is_closed() {
            return PoolError::Closed;
        }
        let state = self.state();
        let cause = self.last_connect_error.lock().clone();
        if state.total == 0 {
            if let Some(cause) = cause {
                return PoolError::Connect(cause);
            }
        }
        PoolError::TimedOut { state, cause }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down the pool");
        self.bag.close();
        for entry in self.bag.values() {
            entry.mark_evicted();
            if self.bag.reserve(&entry) {
                self.close_reserved(&entry, "pool closed");
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// A generic connection pool.
pub struct Pool<M>
where
    M: ManageConnection,
{
    inner: Arc<PoolInner<M>>,
}

impl<M> Clone for Pool<M>
where
    M: ManageConnection,
{
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Pool<M>
where
    M: ManageConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("Pool({:p})", self.inner))
    }
}

impl<M: ManageConnection> Pool<M> {
    pub(crate) fn new_inner(config: Config, manager: M) -> Pool<M> {
        let (demand_tx, demand_rx) = mpsc::channel(1);
        let (recycle_tx, recycle_rx) = mpsc::unbounded_channel();
        let (suspend_tx, _) = watch::channel(false);

        // A borrower about to park nudges the creator directly through the
        // bag, after its waiter count is visible, so the creator can never
        // observe stale demand.
        let bag = {
            let demand_tx = demand_tx.clone();
            ConcurrentBag::new(Box::new(move || {
                let _ = demand_tx.try_send(());
            }))
        };

        let inner = Arc::new(PoolInner {
            config,
            manager,
            bag,
            clock: Clock::new(),
            closed: AtomicBool::new(false),
            pending_creates: AtomicU32::new(0),
            last_connect_error: Mutex::new(None),
            demand_tx,
            demand_rx: Mutex::new(Some(demand_rx)),
            recycle_tx,
            recycle_rx: Mutex::new(Some(recycle_rx)),
            suspend_tx,
            tasks: Mutex::new(Vec::new()),
        });

        Pool { inner }
    }

    /// Establishes connections serially until `min_idle` sit in the bag,
    /// propagating the first failure.
    pub(crate) async fn fill_initial(&self) -> Result<(), M::Error> {
        while (self.inner.bag.len() as u32) < self.inner.config.min_idle {
            let entry = self.inner.create_entry().await?;
            self.inner.bag.add(entry);
        }
        Ok(())
    }

    pub(crate) fn start_background_tasks(&self) {
        let demand_rx = self.inner.demand_rx.lock().take();
        let recycle_rx = self.inner.recycle_rx.lock().take();
        let mut tasks = self.inner.tasks.lock();
        if let Some(rx) = demand_rx {
            tasks.push(tokio::spawn(run_creator(Arc::downgrade(&self.inner), rx)));
        }
        if let Some(rx) = recycle_rx {
            tasks.push(tokio::spawn(run_recycler(Arc::downgrade(&self.inner), rx)));
        }
        tasks.push(tokio::spawn(housekeeper::run(Arc::downgrade(&self.inner))));
    }

    pub(crate) fn request_fill(&self) {
        self.inner.signal_demand();
    }

    /// Returns a `Builder` instance to configure a new pool.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Retrieves a connection from the pool, waiting up to the configured
    /// `connection_timeout`.
    pub async fn get(&self) -> Result<PooledConnection<M>, PoolError<M::Error>> {
        self.get_timeout(self.inner.config.connection_timeout).await
    }

    /// Retrieves a connection from the pool, waiting up to `timeout`.
    ///
    /// Stale candidates (evicted, past their lifetime, or failing the
    /// aliveness check) are closed and the acquisition retried with the
    /// remaining deadline.
    pub async fn get_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<M>, PoolError<M::Error>> {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let bypass_ms = inner.config.alive_bypass_window.as_millis() as u64;

        loop {
            if inner.is_closed() {
                return Err(PoolError::Closed);
            }
            inner.wait_if_suspended(deadline).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let entry = match inner.bag.borrow(remaining).await {
                Err(BagClosed) => return Err(PoolError::Closed),
                Ok(None) => return Err(inner.acquire_timeout_error()),
                Ok(Some(entry)) => entry,
            };

            let now = inner.clock.now_millis();
            if entry.is_marked_evicted() || entry.is_expired(now) {
                inner.close_borrowed(&entry, "evicted or expired");
                continue;
            }
            if now.saturating_sub(entry.last_accessed()) > bypass_ms
                && !inner.validate(&entry).await
            {
                inner.close_borrowed(&entry, "failed aliveness check");
                continue;
            }

            let Some(conn) = entry.take_conn() else {
                inner.close_borrowed(&entry, "lost its connection");
                continue;
            };
            entry.set_last_open(inner.clock.now_millis());
            let leak_task = inner.spawn_leak_task(&entry);
            return Ok(PooledConnection::new(
                Arc::clone(inner),
                entry,
                conn,
                leak_task,
            ));
        }
    }

    /// Returns information about the current state of the pool.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Connections currently managed by the pool.
    pub fn total_connections(&self) -> u32 {
        self.state().total
    }

    /// Connections currently checked out.
    pub fn active_connections(&self) -> u32 {
        self.state().active
    }

    /// Connections sitting idle in the pool.
    pub fn idle_connections(&self) -> u32 {
        self.state().idle
    }

    /// Callers currently blocked waiting for a connection.
    pub fn waiting_count(&self) -> u32 {
        self.state().waiting
    }

    /// The most recent connection creation failure, if any.
    pub fn last_connection_failure(&self) -> Option<Arc<M::Error>> {
        self.inner.last_connect_error.lock().clone()
    }

    /// Marks every current connection for eviction.
    ///
    /// Idle connections are closed immediately; checked-out connections are
    /// closed when returned.
    pub fn soft_evict_connections(&self) {
        self.inner.soft_evict_all();
    }

    /// Suspends the pool: new acquisitions block (up to their deadline)
    /// until [`resume`](Self::resume).
    pub fn suspend(&self) -> Result<(), SuspensionDisabled> {
        if !self.inner.config.allow_pool_suspension {
            return Err(SuspensionDisabled);
        }
        self.inner.suspend_tx.send_replace(true);
        Ok(())
    }

    /// Resumes a suspended pool.
    pub fn resume(&self) -> Result<(), SuspensionDisabled> {
        if !self.inner.config.allow_pool_suspension {
            return Err(SuspensionDisabled);
        }
        if self.inner.suspend_tx.send_replace(false) {
            self.inner.signal_demand();
        }
        Ok(())
    }

    /// Shuts the pool down: rejects new acquisitions, wakes parked waiters
    /// with [`PoolError::Closed`] and closes every connection not in use.
    /// Checked-out connections are closed as they are returned. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// The single worker that serializes connection creation so a struggling
/// database never sees a thundering herd of connect attempts.
async fn run_creator<M>(pool: Weak<PoolInner<M>>, mut demand: mpsc::Receiver<()>)
where
    M: ManageConnection,
{
    let mut backoff = Duration::ZERO;
    while demand.recv().await.is_some() {
        loop {
            let Some(pool) = pool.upgrade() else { return };
            if !pool.needs_connection() {
                break;
            }
            pool.pending_creates.fetch_add(1, Ordering::SeqCst);
            let created = pool.create_entry().await;
            pool.pending_creates.fetch_sub(1, Ordering::SeqCst);
            match created {
                Ok(entry) => {
                    backoff = Duration::ZERO;
                    pool.bag.add(entry);
                }
                Err(err) => {
                    warn!(error = %err, "connection creation failed");
                    *pool.last_connect_error.lock() = Some(Arc::new(err));
                    backoff = backoff.max(CREATE_BACKOFF_FLOOR);
                    backoff = (backoff * 2)
                        .min(pool.config.connection_timeout / 2)
                        .min(CREATE_BACKOFF_CAP);
                    drop(pool);
                    sleep(backoff).await;
                }
            }
        }
    }
}

/// Resets returned connections whose session state diverged from the pool
/// default, off the caller's path. Entries stay checked out until the reset
/// lands, so a half-reset connection is never handed to a borrower.
async fn run_recycler<M>(
    pool: Weak<PoolInner<M>>,
    mut recycled: mpsc::UnboundedReceiver<Recycle<M::Connection>>,
) where
    M: ManageConnection,
{
    while let Some(Recycle {
        entry,
        mut conn,
        dirty,
    }) = recycled.recv().await
    {
        let Some(pool) = pool.upgrade() else { return };
        match pool.manager.reset(&mut conn, dirty).await {
            Ok(()) => {
                entry.put_conn(conn);
                pool.bag.requite(&entry);
            }
            Err(err) => {
                warn!(id = entry.id(), error = %err, "failed to reset connection, discarding");
                pool.bag.remove(&entry);
                drop(conn);
                pool.signal_demand();
            }
        }
    }
}
