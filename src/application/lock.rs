use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-order mutual exclusion, keyed by trade reference.
///
/// Each key gets its own async mutex, so notifications for different orders
/// never wait on each other. A key's entry lives only while somebody holds or
/// waits for it; the last one out removes it, which keeps the map bounded by
/// the number of orders in flight.
#[derive(Default)]
pub struct OrderLockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds the lock for one trade reference until dropped.
pub struct OrderLockGuard<'a> {
    // Field order matters: the mutex guard must be released before the lease
    // checks whether the entry can be reclaimed.
    _guard: OwnedMutexGuard<()>,
    _lease: Lease<'a>,
}

/// Registration of interest in a key. Dropping it reclaims the entry when no
/// other holder or waiter references the mutex.
struct Lease<'a> {
    registry: &'a OrderLockRegistry,
    trade_no: String,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.registry
            .locks
            .remove_if(&self.trade_no, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl OrderLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `trade_no`.
    ///
    /// Cancel safe: dropping the returned future while it waits releases the
    /// registration as well.
    pub async fn acquire(&self, trade_no: &str) -> OrderLockGuard<'_> {
        let lease = Lease {
            registry: self,
            trade_no: trade_no.to_string(),
        };
        // The shard guard from `entry` must not be held across the await
        let lock = self.locks.entry(trade_no.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        OrderLockGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Runs `f` while holding the lock for `trade_no`. The lock is released on
    /// every exit path, including a panic inside `f`.
    pub async fn with_order_lock<F, Fut, T>(&self, trade_no: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(trade_no).await;
        f().await
    }

    /// Number of trade references currently held or waited on.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}
