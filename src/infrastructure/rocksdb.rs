use crate::domain::order::TopUpOrder;
use crate::domain::ports::OrderStore;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for storing top-up orders, keyed by trade reference.
pub const CF_ORDERS: &str = "orders";

/// A persistent order store backed by RocksDB.
///
/// Orders are stored as JSON under their trade reference. RocksDB has no
/// put-if-absent, so inserts are serialized through `insert_lock` to keep the
/// duplicate check and the write together.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbOrderStore {
    db: Arc<DB>,
    insert_lock: Arc<Mutex<()>>,
}

impl RocksDbOrderStore {
    /// Opens or creates a RocksDB instance at `path`, creating the orders
    /// column family if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_orders = ColumnFamilyDescriptor::new(CF_ORDERS, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_orders])?;

        Ok(Self {
            db: Arc::new(db),
            insert_lock: Arc::new(Mutex::new(())),
        })
    }

    fn orders_cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_ORDERS)
            .ok_or_else(|| PaymentError::Storage("orders column family not found".into()))
    }

    fn read(&self, trade_no: &str) -> Result<Option<TopUpOrder>> {
        let cf = self.orders_cf()?;
        match self.db.get_cf(cf, trade_no.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, order: &TopUpOrder) -> Result<()> {
        let cf = self.orders_cf()?;
        let value = serde_json::to_vec(order)?;
        self.db.put_cf(cf, order.trade_no().as_bytes(), value)?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for RocksDbOrderStore {
    async fn find_by_trade_no(&self, trade_no: &str) -> Result<Option<TopUpOrder>> {
        self.read(trade_no)
    }

    async fn insert(&self, order: TopUpOrder) -> Result<()> {
        let _guard = self.insert_lock.lock().await;
        if self.read(order.trade_no())?.is_some() {
            return Err(PaymentError::Storage(format!(
                "order {} already exists",
                order.trade_no()
            )));
        }
        self.write(&order)
    }

    async fn update(&self, order: TopUpOrder) -> Result<()> {
        if self.read(order.trade_no())?.is_none() {
            return Err(PaymentError::OrderNotFound(order.trade_no().to_string()));
        }
        self.write(&order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::order::{OrderStatus, PaymentMethod};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_order_store() {
        let dir = tempdir().unwrap();
        let store = RocksDbOrderStore::open(dir.path()).unwrap();

        let mut order = TopUpOrder::new(3, 500, Money::round(dec!(540)), PaymentMethod::Wechat);
        store.insert(order.clone()).await.unwrap();
        assert!(store.insert(order.clone()).await.is_err());

        order.mark_success(Utc::now());
        store.update(order.clone()).await.unwrap();

        let found = store.find_by_trade_no(order.trade_no()).await.unwrap().unwrap();
        assert_eq!(found.status(), OrderStatus::Success);
        assert_eq!(found.money().to_string(), "540.00");
    }

    #[tokio::test]
    async fn test_orders_survive_reopen() {
        let dir = tempdir().unwrap();
        let order = TopUpOrder::new(3, 10, Money::round(dec!(73)), PaymentMethod::Alipay);
        {
            let store = RocksDbOrderStore::open(dir.path()).unwrap();
            store.insert(order.clone()).await.unwrap();
        }
        let store = RocksDbOrderStore::open(dir.path()).unwrap();
        assert_eq!(store.find_by_trade_no(order.trade_no()).await.unwrap(), Some(order));
    }
}
