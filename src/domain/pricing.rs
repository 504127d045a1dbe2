//! Money owed for a top-up, and the conversions between the quantity a user
//! types and the quota the ledger stores.
//!
//! Everything here is pure and works on `Decimal`; rounding happens exactly once,
//! in [`Money::round`], at the very end of [`compute_payable`].

use crate::domain::money::Money;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Group of users with no explicit assignment.
pub const DEFAULT_GROUP: &str = "default";

/// Purchase-quantity tier → price multiplier.
///
/// Tiers are authored in the units the user sees, so lookups always use the
/// quantity as requested, before any unit conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscountTable(HashMap<i64, Decimal>);

impl DiscountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, quantity: i64, multiplier: Decimal) -> Self {
        self.0.insert(quantity, multiplier);
        self
    }

    /// Multiplier for an exact tier, or 1 when absent or non-positive.
    pub fn multiplier(&self, quantity: i64) -> Decimal {
        match self.0.get(&quantity) {
            Some(discount) if *discount > Decimal::ZERO => *discount,
            _ => Decimal::ONE,
        }
    }
}

/// Pricing group → price multiplier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupRatio(HashMap<String, Decimal>);

impl GroupRatio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>, ratio: Decimal) -> Self {
        self.0.insert(group.into(), ratio);
        self
    }

    /// Ratio for a group; a missing or zero ratio is normalized to 1.
    pub fn ratio(&self, group: &str) -> Decimal {
        match self.0.get(group) {
            Some(ratio) if *ratio > Decimal::ZERO => *ratio,
            _ => Decimal::ONE,
        }
    }
}

/// How quota quantities are shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaDisplayType {
    /// Quantities are currency units; one unit buys `quota_per_unit` quota.
    #[default]
    Currency,
    /// Quantities are raw quota tokens.
    Tokens,
}

/// Conversion between display quantities and ledger quota.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    pub display_type: QuotaDisplayType,
    pub quota_per_unit: Decimal,
}

impl UnitConversion {
    pub fn new(display_type: QuotaDisplayType, quota_per_unit: Decimal) -> Self {
        Self {
            display_type,
            quota_per_unit,
        }
    }

    /// Quantity in purchase (currency) units, exact.
    pub fn to_purchase_units(&self, quantity: Decimal) -> Decimal {
        match self.display_type {
            QuotaDisplayType::Tokens => quantity / self.quota_per_unit,
            QuotaDisplayType::Currency => quantity,
        }
    }

    /// Quantity stored on a new order.
    pub fn order_quantity(&self, requested: i64) -> i64 {
        self.to_purchase_units(Decimal::from(requested))
            .trunc()
            .to_i64()
            .unwrap_or(0)
    }

    /// Minimum allowed request, expressed in display units.
    pub fn min_topup(&self, configured_minimum: i64) -> i64 {
        match self.display_type {
            QuotaDisplayType::Tokens => (Decimal::from(configured_minimum) * self.quota_per_unit)
                .trunc()
                .to_i64()
                .unwrap_or(i64::MAX),
            QuotaDisplayType::Currency => configured_minimum,
        }
    }

    /// Quota credited for a paid order, floored. `None` on overflow.
    pub fn ledger_credit(&self, order_amount: i64) -> Option<i64> {
        Decimal::from(order_amount)
            .checked_mul(self.quota_per_unit)?
            .floor()
            .to_i64()
    }
}

/// Computes the money owed for `quantity`.
///
/// The discount is keyed on `quantity` as requested; the price is applied to
/// the quantity after unit conversion.
pub fn compute_payable(
    quantity: i64,
    group_ratio: Decimal,
    discounts: &DiscountTable,
    unit_price: Decimal,
    conversion: &UnitConversion,
) -> Money {
    let purchased = conversion.to_purchase_units(Decimal::from(quantity));
    let group_ratio = if group_ratio > Decimal::ZERO {
        group_ratio
    } else {
        Decimal::ONE
    };
    let discount = discounts.multiplier(quantity);
    Money::round(purchased * unit_price * group_ratio * discount)
}

/// The full pricing configuration of a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingPolicy {
    pub unit_price: Decimal,
    pub conversion: UnitConversion,
    pub group_ratios: GroupRatio,
    pub discounts: DiscountTable,
}

impl PricingPolicy {
    pub fn payable(&self, quantity: i64, group: &str) -> Money {
        compute_payable(
            quantity,
            self.group_ratios.ratio(group),
            &self.discounts,
            self.unit_price,
            &self.conversion,
        )
    }

    /// Like [`PricingPolicy::payable`], refusing amounts no provider would charge.
    pub fn quote(&self, quantity: i64, group: &str) -> Result<Money> {
        let money = self.payable(quantity, group);
        if money < Money::minimum_charge() {
            return Err(PaymentError::AmountTooLow);
        }
        Ok(money)
    }
}
