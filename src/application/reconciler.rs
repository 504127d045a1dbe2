use crate::application::lock::OrderLockRegistry;
use crate::domain::notification::{AckResponse, Acknowledgement, ProviderNotification};
use crate::domain::order::TopUpOrder;
use crate::domain::ports::{OrderStoreRef, QuotaLedgerRef};
use crate::domain::pricing::UnitConversion;
use crate::error::{PaymentError, Result};
use crate::gateway::{PaymentGateway, acknowledgement};
use chrono::Utc;
use dashmap::DashMap;
use log::{error, info, warn};
use std::time::Duration;

pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(5);

/// What a notification that was accepted did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The order moved to `Success` and the ledger was credited.
    Credited { quota: i64 },
    /// The order had already been completed; nothing changed.
    AlreadyProcessed,
}

/// Turns provider notifications into at most one ledger credit per order.
///
/// Each notification is parsed, authenticated, then applied under the order's
/// lock so concurrent deliveries for one trade reference are serialized.
pub struct ReconciliationProcessor {
    orders: OrderStoreRef,
    ledger: QuotaLedgerRef,
    conversion: UnitConversion,
    locks: OrderLockRegistry,
    ledger_timeout: Duration,
    /// Credits the ledger accepted but whose order update was never persisted.
    /// A redelivery of such an order only retries the update.
    unsettled: DashMap<String, i64>,
}

impl ReconciliationProcessor {
    pub fn new(orders: OrderStoreRef, ledger: QuotaLedgerRef, conversion: UnitConversion) -> Self {
        Self {
            orders,
            ledger,
            conversion,
            locks: OrderLockRegistry::new(),
            ledger_timeout: DEFAULT_LEDGER_TIMEOUT,
            unsettled: DashMap::new(),
        }
    }

    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    /// Handles one callback body and renders the acknowledgement for the
    /// provider. Never fails: every error becomes a negative acknowledgement.
    pub async fn handle_notification(&self, gateway: &dyn PaymentGateway, raw: &[u8]) -> AckResponse {
        let method = gateway.payment_method();
        let ack = match gateway.parse_notification(raw) {
            Ok(notification) => {
                let trade_no = notification.trade_no.clone();
                match self.reconcile_notification(gateway, notification).await {
                    Ok(_) => Acknowledgement::Success,
                    Err(e) => {
                        warn!("{method} notification for {trade_no} rejected: {e}");
                        Acknowledgement::Failure(e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!("Unreadable {method} notification: {e}");
                Acknowledgement::Failure(e.to_string())
            }
        };
        acknowledgement(method, &ack)
    }

    /// Parses, authenticates and applies a raw callback body.
    pub async fn reconcile_payload(&self, gateway: &dyn PaymentGateway, raw: &[u8]) -> Result<ReconcileOutcome> {
        let notification = gateway.parse_notification(raw)?;
        self.reconcile_notification(gateway, notification).await
    }

    async fn reconcile_notification(
        &self,
        gateway: &dyn PaymentGateway,
        notification: ProviderNotification,
    ) -> Result<ReconcileOutcome> {
        if !gateway.verify_authenticity(&notification.fields) {
            return Err(PaymentError::InvalidSignature);
        }
        info!(
            "{} notification for {} (provider id {}, status {})",
            notification.payment_method,
            notification.trade_no,
            notification.provider_trade_id,
            notification.status
        );

        let trade_no = notification.trade_no.clone();
        self.locks
            .with_order_lock(&trade_no, || self.apply(notification))
            .await
    }

    /// Must only run while holding the order's lock.
    async fn apply(&self, notification: ProviderNotification) -> Result<ReconcileOutcome> {
        let trade_no = notification.trade_no.as_str();
        let mut order = self
            .orders
            .find_by_trade_no(trade_no)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(trade_no.to_string()))?;

        if !order.is_pending() {
            self.unsettled.remove(trade_no);
            info!("Order {trade_no} already processed");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }
        if order.payment_method() != notification.payment_method {
            return Err(PaymentError::PaymentMethodMismatch {
                trade_no: trade_no.to_string(),
                expected: order.payment_method(),
                actual: notification.payment_method,
            });
        }
        if !notification.succeeded {
            return Err(PaymentError::PaymentNotCompleted(notification.status));
        }

        let previously_credited = self.unsettled.get(trade_no).map(|quota| *quota);
        let quota = match previously_credited {
            Some(quota) => {
                warn!("Order {trade_no} was credited {quota} before; retrying the order update only");
                quota
            }
            None => {
                let quota = self.conversion.ledger_credit(order.amount()).ok_or_else(|| {
                    PaymentError::LedgerCreditFailed(format!("credit for {} overflows", order.amount()))
                })?;
                self.credit(&order, quota).await?;
                self.unsettled.insert(trade_no.to_string(), quota);
                quota
            }
        };

        order.mark_success(Utc::now());
        if let Err(e) = self.orders.update(order.clone()).await {
            error!("Order {trade_no} was credited {quota} but could not be marked paid: {e}");
            return Err(e);
        }
        self.unsettled.remove(trade_no);

        info!(
            target: "audit",
            "top-up completed: user={} trade_no={} provider_id={} method={} quota={} money={}",
            order.user_id(),
            trade_no,
            notification.provider_trade_id,
            order.payment_method(),
            quota,
            order.money()
        );
        Ok(ReconcileOutcome::Credited { quota })
    }

    async fn credit(&self, order: &TopUpOrder, quota: i64) -> Result<()> {
        match tokio::time::timeout(self.ledger_timeout, self.ledger.credit(order.user_id(), quota)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PaymentError::LedgerCreditFailed(e.to_string())),
            Err(_) => Err(PaymentError::LedgerCreditFailed(format!(
                "no answer within {:?}",
                self.ledger_timeout
            ))),
        }
    }
}
