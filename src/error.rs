use thiserror::Error;

use crate::domain::order::PaymentMethod;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("{0} payments are not configured")]
    ConfigurationMissing(PaymentMethod),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("Payment provider rejected the request: {0}")]
    ProviderRejected(String),
    #[error("Unexpected payment provider response: {0}")]
    ProviderProtocolError(String),
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),
    #[error("Notification signature verification failed")]
    InvalidSignature,
    #[error("Order {0} not found")]
    OrderNotFound(String),
    #[error("Order {trade_no} was paid with {expected}, but the notification came from {actual}")]
    PaymentMethodMismatch {
        trade_no: String,
        expected: PaymentMethod,
        actual: PaymentMethod,
    },
    #[error("Payment not completed, provider status: {0}")]
    PaymentNotCompleted(String),
    #[error("Quota ledger credit failed: {0}")]
    LedgerCreditFailed(String),
    #[error("Top-up quantity must be at least {minimum}")]
    BelowMinimumTopUp { minimum: i64 },
    #[error("Payable amount is too low")]
    AmountTooLow,
    #[error("Unsupported payment method: {0}")]
    UnsupportedPaymentMethod(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
