//! The background task enforcing lifetime and idle limits.

use std::sync::{Arc, Weak};

use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::bag::{BagItem, STATE_NOT_IN_USE};
use crate::entry::PoolEntry;
use crate::pool::PoolInner;
use crate::ManageConnection;

/// Extra slack on top of the housekeeping period before an inter-tick gap is
/// treated as a clock anomaly.
const CLOCK_JUMP_TOLERANCE_MS: u64 = 15_000;

const IDLE_TIMEOUT_REASON: &str = "idle timeout";

/// Periodic pass over the pool: retires aged and surplus idle connections,
/// then tops the pool back up to `min_idle`.
///
/// Holds only a weak reference so an abandoned pool can shut down; faults
/// never propagate to borrowers.
pub(crate) async fn run<M>(pool: Weak<PoolInner<M>>)
where
    M: ManageConnection,
{
    let (period, mut previous) = match pool.upgrade() {
        Some(pool) => (
            pool.config.housekeeping_period,
            pool.clock.now_millis(),
        ),
        None => return,
    };
    let period_ms = period.as_millis() as u64;
    let mut ticks = interval_at(Instant::now() + period, period);

    loop {
        ticks.tick().await;
        let Some(pool) = pool.upgrade() else { return };
        if pool.is_closed() {
            return;
        }

        let now = pool.clock.now_millis();
        // The clock is monotonic, so only forward jumps (host suspended,
        // VM migrated) can occur. Connections may have quietly died during
        // the gap, so refresh them all.
        if now.saturating_sub(previous) > period_ms + CLOCK_JUMP_TOLERANCE_MS {
            warn!(
                previous_ms = previous,
                now_ms = now,
                "unusual clock jump detected, soft-evicting all connections"
            );
            previous = now;
            pool.soft_evict_all();
            continue;
        }
        previous = now;

        let mut idle: Vec<_> = pool
            .bag
            .values()
            .into_iter()
            .filter(|entry| entry.state() == STATE_NOT_IN_USE)
            .collect();
        idle.sort_by_key(|entry| entry.last_accessed());

        // Idle-timeout evictions are budgeted so the pool never thins below
        // min_idle; lifetime and soft evictions are unconditional and the
        // top-up below replaces them.
        let mut surplus = (idle.len() as u32).saturating_sub(pool.config.min_idle);
        let idle_after = pool
            .config
            .idle_timeout
            .map(|timeout| timeout.as_millis() as u64);
        let verdict = |entry: &Arc<PoolEntry<M::Connection>>, surplus: u32| {
            if entry.is_expired(now) {
                Some("reached max lifetime")
            } else if entry.is_marked_evicted() {
                Some("marked for eviction")
            } else if surplus > 0
                && idle_after
                    .is_some_and(|limit| now.saturating_sub(entry.last_accessed()) > limit)
            {
                Some(IDLE_TIMEOUT_REASON)
            } else {
                None
            }
        };

        for entry in &idle {
            if verdict(entry, surplus).is_none() {
                continue;
            }
            if !pool.bag.reserve(entry) {
                continue;
            }
            // Confirm against fresh timestamps: the entry may have been
            // borrowed and returned since the snapshot was taken.
            match verdict(entry, surplus) {
                Some(reason) => {
                    if reason == IDLE_TIMEOUT_REASON {
                        surplus -= 1;
                    }
                    pool.close_reserved(entry, reason);
                }
                None => pool.bag.unreserve(entry),
            }
        }

        debug!("pool stats ({})", pool.state());
        pool.signal_demand();
    }
}
