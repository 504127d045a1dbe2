//! Application layer: the workflows built on top of the domain and the gateways.
//!
//! `TopUpService` creates orders and asks providers for payment handles;
//! `ReconciliationProcessor` turns provider notifications into ledger credits,
//! serialized per order by the `OrderLockRegistry`.

pub mod lock;
pub mod reconciler;
pub mod topup;
