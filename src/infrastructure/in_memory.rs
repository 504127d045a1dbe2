use crate::domain::order::TopUpOrder;
use crate::domain::ports::{OrderStore, QuotaLedger, UserGroups};
use crate::domain::pricing::DEFAULT_GROUP;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Takes one unit from a fault counter, returning whether a fault is due.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A thread-safe in-memory order store.
///
/// Uses `Arc<RwLock<HashMap<String, TopUpOrder>>>` keyed by trade reference.
/// Used when no database path is given, and in tests, where
/// [`InMemoryOrderStore::fail_next_updates`] simulates a storage outage.
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<String, TopUpOrder>>>,
    failing_updates: Arc<AtomicUsize>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to `update` fail without writing.
    pub async fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn find_by_trade_no(&self, trade_no: &str) -> Result<Option<TopUpOrder>> {
        let orders = self.orders.read().await;
        Ok(orders.get(trade_no).cloned())
    }

    async fn insert(&self, order: TopUpOrder) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(order.trade_no()) {
            return Err(PaymentError::Storage(format!(
                "order {} already exists",
                order.trade_no()
            )));
        }
        orders.insert(order.trade_no().to_string(), order);
        Ok(())
    }

    async fn update(&self, order: TopUpOrder) -> Result<()> {
        if take_fault(&self.failing_updates) {
            return Err(PaymentError::Storage("simulated update failure".into()));
        }
        let mut orders = self.orders.write().await;
        match orders.get_mut(order.trade_no()) {
            Some(existing) => {
                *existing = order;
                Ok(())
            }
            None => Err(PaymentError::OrderNotFound(order.trade_no().to_string())),
        }
    }
}

/// An in-memory quota ledger that records every credit.
///
/// Stands in for the real balance service during development and tests. It can
/// be told to fail or to answer slowly.
#[derive(Default, Clone)]
pub struct InMemoryQuotaLedger {
    balances: Arc<RwLock<HashMap<i64, i64>>>,
    credits: Arc<RwLock<Vec<(i64, i64)>>>,
    failing_credits: Arc<AtomicUsize>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` credits fail without changing any balance.
    pub async fn fail_next_credits(&self, n: usize) {
        self.failing_credits.store(n, Ordering::SeqCst);
    }

    /// Delays every credit by `delay` before applying it.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub async fn balance(&self, user_id: i64) -> i64 {
        self.balances.read().await.get(&user_id).copied().unwrap_or(0)
    }

    /// Number of credits applied so far.
    pub async fn credit_count(&self) -> usize {
        self.credits.read().await.len()
    }

    /// Every applied credit as `(user_id, quota)`, in order.
    pub async fn credits(&self) -> Vec<(i64, i64)> {
        self.credits.read().await.clone()
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn credit(&self, user_id: i64, quota: i64) -> Result<()> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_fault(&self.failing_credits) {
            return Err(PaymentError::LedgerCreditFailed("simulated ledger outage".into()));
        }
        let mut balances = self.balances.write().await;
        let balance = balances.entry(user_id).or_insert(0);
        *balance = balance.checked_add(quota).ok_or_else(|| {
            PaymentError::LedgerCreditFailed(format!("balance of user {user_id} overflows"))
        })?;
        self.credits.write().await.push((user_id, quota));
        Ok(())
    }
}

/// Static user → pricing group assignments; everyone else is in
/// [`DEFAULT_GROUP`].
#[derive(Default, Clone)]
pub struct InMemoryUserGroups {
    groups: Arc<RwLock<HashMap<i64, String>>>,
}

impl InMemoryUserGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign(&self, user_id: i64, group: impl Into<String>) {
        self.groups.write().await.insert(user_id, group.into());
    }
}

impl From<HashMap<i64, String>> for InMemoryUserGroups {
    fn from(groups: HashMap<i64, String>) -> Self {
        Self {
            groups: Arc::new(RwLock::new(groups)),
        }
    }
}

#[async_trait]
impl UserGroups for InMemoryUserGroups {
    async fn group_of(&self, user_id: i64) -> Result<String> {
        let groups = self.groups.read().await;
        Ok(groups
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string()))
    }
}
