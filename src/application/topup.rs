use crate::domain::money::Money;
use crate::domain::order::{PaymentMethod, TopUpOrder};
use crate::domain::ports::{OrderStoreRef, UserGroupsRef};
use crate::domain::pricing::PricingPolicy;
use crate::error::{PaymentError, Result};
use crate::gateway::{DEFAULT_SUBJECT, Gateways, PaymentGateway, PaymentRequest};
use log::{info, warn};
use std::sync::Arc;

/// A user's request to buy quota.
///
/// Carries no pricing group: that is looked up for `user_id`.
#[derive(Debug, Clone)]
pub struct TopUpRequest {
    pub user_id: i64,
    /// Quantity in display units.
    pub amount: i64,
    pub payment_method: PaymentMethod,
    pub client_ip: String,
}

/// What the payer needs to complete a purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentHandle {
    pub trade_no: String,
    /// QR code payload returned by the provider.
    pub pay_url: String,
}

/// Prices purchases, records pending orders and registers them with providers.
pub struct TopUpService {
    orders: OrderStoreRef,
    users: UserGroupsRef,
    gateways: Arc<Gateways>,
    pricing: PricingPolicy,
    server_address: String,
}

impl TopUpService {
    pub fn new(
        orders: OrderStoreRef,
        users: UserGroupsRef,
        gateways: Arc<Gateways>,
        pricing: PricingPolicy,
        server_address: impl Into<String>,
    ) -> Self {
        Self {
            orders,
            users,
            gateways,
            pricing,
            server_address: server_address.into(),
        }
    }

    /// Callback URL registered with the provider for `method`.
    pub fn notify_url(&self, method: PaymentMethod) -> String {
        format!(
            "{}/api/{method}/notify",
            self.server_address.trim_end_matches('/')
        )
    }

    /// Smallest quantity accepted for `method`, in display units.
    pub fn min_topup(&self, method: PaymentMethod) -> Result<i64> {
        let gateway = self.gateways.get(method)?;
        Ok(self.pricing.conversion.min_topup(gateway.min_topup()))
    }

    /// Money `user_id` would owe for `amount`, without creating anything.
    pub async fn quote(&self, method: PaymentMethod, user_id: i64, amount: i64) -> Result<Money> {
        self.check_minimum(method, amount)?;
        let group = self.users.group_of(user_id).await?;
        self.pricing.quote(amount, &group)
    }

    /// Creates a `Pending` order and asks the provider for a payment handle.
    ///
    /// Nothing is stored unless the request passes the minimum and pricing
    /// checks. If the provider call fails, the order stays `Pending` and is
    /// simply never paid.
    pub async fn request_payment(&self, request: TopUpRequest) -> Result<PaymentHandle> {
        let method = request.payment_method;
        let gateway = self.gateways.get(method)?;
        self.check_minimum(method, request.amount)?;
        let group = self.users.group_of(request.user_id).await?;
        let money = self.pricing.quote(request.amount, &group)?;

        let order = TopUpOrder::new(
            request.user_id,
            self.pricing.conversion.order_quantity(request.amount),
            money,
            method,
        );
        let trade_no = order.trade_no().to_string();
        self.orders.insert(order).await?;

        let notify_url = self.notify_url(method);
        let payment = PaymentRequest {
            trade_no: &trade_no,
            amount: money,
            notify_url: &notify_url,
            client_ip: &request.client_ip,
            subject: DEFAULT_SUBJECT,
        };
        let pay_url = gateway.initiate_payment(&payment).await.inspect_err(|e| {
            warn!("{method} payment initiation for {trade_no} failed: {e}");
        })?;

        info!(
            "Created {method} top-up {trade_no} for user {} ({group}): amount {} money {money}",
            request.user_id, request.amount
        );
        Ok(PaymentHandle { trade_no, pay_url })
    }

    fn check_minimum(&self, method: PaymentMethod, amount: i64) -> Result<()> {
        let minimum = self.min_topup(method)?;
        if amount < minimum {
            return Err(PaymentError::BelowMinimumTopUp { minimum });
        }
        Ok(())
    }
}
