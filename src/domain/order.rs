use crate::domain::money::Money;
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Every trade reference starts with this prefix.
pub const TRADE_NO_PREFIX: &str = "ref_";
/// Both providers cap `out_trade_no` at 32 characters.
pub const TRADE_NO_LEN: usize = 32;

static TRADE_NO_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Alipay,
    Wechat,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Alipay => "alipay",
            PaymentMethod::Wechat => "wechat",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alipay" => Ok(PaymentMethod::Alipay),
            "wechat" => Ok(PaymentMethod::Wechat),
            other => Err(PaymentError::UnsupportedPaymentMethod(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Success,
}

/// One purchase attempt.
///
/// The trade reference, quantity and money are fixed when the order is created;
/// the only mutation an order ever sees is [`TopUpOrder::mark_success`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopUpOrder {
    trade_no: String,
    user_id: i64,
    /// Quantity in the ledger's display unit.
    amount: i64,
    money: Money,
    payment_method: PaymentMethod,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TopUpOrder {
    /// Creates a new `Pending` order with a freshly generated trade reference.
    pub fn new(user_id: i64, amount: i64, money: Money, payment_method: PaymentMethod) -> Self {
        Self {
            trade_no: generate_trade_no(payment_method, user_id),
            user_id,
            amount,
            money,
            payment_method,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn trade_no(&self) -> &str {
        &self.trade_no
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn money(&self) -> Money {
        self.money
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    /// Moves the order to `Success`. Returns `false` if it already was.
    pub fn mark_success(&mut self, completed_at: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = OrderStatus::Success;
        self.completed_at = Some(completed_at);
        true
    }
}

/// Generates a trade reference from the user id, the current time, a process-wide
/// sequence number and random entropy, hashed so none of it leaks to the provider.
pub fn generate_trade_no(payment_method: PaymentMethod, user_id: i64) -> String {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    let sequence = TRADE_NO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let reference = format!(
        "{payment_method}-ref-{user_id}-{}-{sequence}-{nonce}",
        Utc::now().timestamp_millis()
    );
    let digest = hex::encode(Sha256::digest(reference.as_bytes()));
    format!(
        "{TRADE_NO_PREFIX}{}",
        &digest[..TRADE_NO_LEN - TRADE_NO_PREFIX.len()]
    )
}
