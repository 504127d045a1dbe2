use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of fractional digits every charged amount is rounded to.
pub const MONEY_SCALE: u32 = 2;

/// A monetary amount charged to a user, fixed to two decimal places.
///
/// This is a wrapper around `rust_decimal::Decimal` so that amounts never pass
/// through binary floating point. The only way to build one from an arbitrary
/// decimal is [`Money::round`], which applies round-half-even once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Rounds an exact decimal to the money scale using banker's rounding.
    pub fn round(value: Decimal) -> Self {
        Self(value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven))
    }

    /// The smallest amount a provider will accept for a charge.
    pub fn minimum_charge() -> Self {
        Self(Decimal::new(1, MONEY_SCALE))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Amount in the smallest currency unit (cents / fen).
    pub fn to_cents(&self) -> Option<i64> {
        (self.0 * Decimal::ONE_HUNDRED).trunc().to_i64()
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}
