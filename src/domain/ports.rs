use super::order::TopUpOrder;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Persistence for top-up orders.
///
/// Implementations must offer read-your-writes consistency within a process.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_trade_no(&self, trade_no: &str) -> Result<Option<TopUpOrder>>;
    /// Fails if an order with the same trade reference already exists.
    async fn insert(&self, order: TopUpOrder) -> Result<()>;
    async fn update(&self, order: TopUpOrder) -> Result<()>;
}

/// The balance ledger credited when a payment completes.
///
/// Not assumed to be idempotent: callers must make sure a credit is attempted at
/// most once per order.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn credit(&self, user_id: i64, quota: i64) -> Result<()>;
}

/// Pricing group membership, owned by the account system.
#[async_trait]
pub trait UserGroups: Send + Sync {
    async fn group_of(&self, user_id: i64) -> Result<String>;
}

pub type OrderStoreRef = Arc<dyn OrderStore>;
pub type QuotaLedgerRef = Arc<dyn QuotaLedger>;
pub type UserGroupsRef = Arc<dyn UserGroups>;
