//! Runtime configuration.
//!
//! Every setting can be given on the command line or through the environment
//! (a `.env` file is honoured by the binary). Group ratios, discount tables and
//! user group assignments are JSON objects, e.g.
//! `TOPUP_AMOUNT_DISCOUNTS='{"500": "0.9"}'` or `TOPUP_USER_GROUPS='{"42": "vip"}'`.

use crate::domain::pricing::{DiscountTable, GroupRatio, PricingPolicy, QuotaDisplayType, UnitConversion};
use crate::error::{PaymentError, Result};
use crate::gateway::{alipay, wechat};
use clap::{Args, ValueEnum};
use log::warn;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::time::Duration;

/// A value that never shows up in logs or `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret<T>
where
    T: Clone + Default,
{
    value: T,
}

impl<T: Clone + Default> Secret<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn reveal(&self) -> &T {
        &self.value
    }
}

impl<T: Clone + Default> Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

impl<T: Clone + Default> Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("****")
    }
}

#[derive(Clone, Debug)]
pub struct AlipayConfig {
    pub app_id: String,
    /// Merchant application private key (PKCS#1 or PKCS#8, PEM or bare base64).
    pub private_key: Secret<String>,
    /// Alipay platform public key used to verify notifications. Without it every
    /// notification is rejected.
    pub public_key: Option<String>,
    pub gateway_url: String,
    pub min_topup: i64,
}

#[derive(Clone, Debug)]
pub struct WechatConfig {
    pub mch_id: String,
    pub app_id: Option<String>,
    /// API v2 key shared with WeChat Pay, used for MD5 signatures.
    pub api_key: Secret<String>,
    pub gateway_url: String,
    pub min_topup: i64,
}

#[derive(Clone, Debug)]
pub struct PaymentSettings {
    /// Public base URL the providers call back to.
    pub server_address: String,
    pub pricing: PricingPolicy,
    /// User id → pricing group. Unlisted users are in the default group.
    pub user_groups: HashMap<i64, String>,
    pub alipay: Option<AlipayConfig>,
    pub wechat: Option<WechatConfig>,
    pub provider_timeout: Duration,
    pub ledger_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DisplayUnit {
    Currency,
    Tokens,
}

impl From<DisplayUnit> for QuotaDisplayType {
    fn from(unit: DisplayUnit) -> Self {
        match unit {
            DisplayUnit::Currency => QuotaDisplayType::Currency,
            DisplayUnit::Tokens => QuotaDisplayType::Tokens,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct SettingsArgs {
    /// Public base URL of this server, used to build provider callback URLs
    #[arg(long, env = "TOPUP_SERVER_ADDRESS", default_value = "http://localhost:3000")]
    pub server_address: String,

    /// Price of one currency unit of quota
    #[arg(long, env = "TOPUP_PRICE", default_value = "7.3")]
    pub price: Decimal,

    /// Ledger quota per currency unit
    #[arg(long, env = "TOPUP_QUOTA_PER_UNIT", default_value = "500000")]
    pub quota_per_unit: Decimal,

    /// Unit in which users enter top-up quantities
    #[arg(long, env = "TOPUP_DISPLAY_UNIT", value_enum, default_value_t = DisplayUnit::Currency)]
    pub display_unit: DisplayUnit,

    /// JSON object of pricing group -> ratio
    #[arg(long, env = "TOPUP_GROUP_RATIOS", default_value = "{}")]
    pub group_ratios: String,

    /// JSON object of top-up quantity -> discount multiplier
    #[arg(long, env = "TOPUP_AMOUNT_DISCOUNTS", default_value = "{}")]
    pub amount_discounts: String,

    /// JSON object of user id -> pricing group
    #[arg(long, env = "TOPUP_USER_GROUPS", default_value = "{}")]
    pub user_groups: String,

    #[arg(long, env = "ALIPAY_APP_ID")]
    pub alipay_app_id: Option<String>,

    #[arg(long, env = "ALIPAY_PRIVATE_KEY", hide_env_values = true)]
    pub alipay_private_key: Option<String>,

    #[arg(long, env = "ALIPAY_PUBLIC_KEY")]
    pub alipay_public_key: Option<String>,

    #[arg(long, env = "ALIPAY_GATEWAY_URL", default_value = alipay::PRODUCTION_GATEWAY)]
    pub alipay_gateway_url: String,

    #[arg(long, env = "ALIPAY_MIN_TOPUP", default_value_t = 1)]
    pub alipay_min_topup: i64,

    #[arg(long, env = "WECHAT_MCH_ID")]
    pub wechat_mch_id: Option<String>,

    #[arg(long, env = "WECHAT_APP_ID")]
    pub wechat_app_id: Option<String>,

    #[arg(long, env = "WECHAT_API_V2_KEY", hide_env_values = true)]
    pub wechat_api_key: Option<String>,

    #[arg(long, env = "WECHAT_GATEWAY_URL", default_value = wechat::UNIFIED_ORDER_URL)]
    pub wechat_gateway_url: String,

    #[arg(long, env = "WECHAT_MIN_TOPUP", default_value_t = 1)]
    pub wechat_min_topup: i64,

    /// Timeout for calls to the payment providers, in seconds
    #[arg(long, env = "TOPUP_PROVIDER_TIMEOUT_SECS", default_value_t = 10)]
    pub provider_timeout_secs: u64,

    /// Timeout for quota ledger credits, in seconds
    #[arg(long, env = "TOPUP_LEDGER_TIMEOUT_SECS", default_value_t = 5)]
    pub ledger_timeout_secs: u64,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SettingsArgs {
    pub fn into_settings(self) -> Result<PaymentSettings> {
        if self.price <= Decimal::ZERO {
            return Err(PaymentError::InvalidConfiguration(format!(
                "price must be positive, got {}",
                self.price
            )));
        }
        if self.quota_per_unit <= Decimal::ZERO {
            return Err(PaymentError::InvalidConfiguration(format!(
                "quota per unit must be positive, got {}",
                self.quota_per_unit
            )));
        }
        let group_ratios: GroupRatio = serde_json::from_str(&self.group_ratios).map_err(|e| {
            PaymentError::InvalidConfiguration(format!("group ratios are not valid JSON: {e}"))
        })?;
        let discounts: DiscountTable = serde_json::from_str(&self.amount_discounts).map_err(|e| {
            PaymentError::InvalidConfiguration(format!("amount discounts are not valid JSON: {e}"))
        })?;
        let user_groups: HashMap<i64, String> = serde_json::from_str(&self.user_groups).map_err(|e| {
            PaymentError::InvalidConfiguration(format!("user groups are not valid JSON: {e}"))
        })?;

        let alipay = match (non_empty(self.alipay_app_id), non_empty(self.alipay_private_key)) {
            (Some(app_id), Some(private_key)) => {
                let public_key = non_empty(self.alipay_public_key);
                if public_key.is_none() {
                    warn!("ALIPAY_PUBLIC_KEY is not set. Every Alipay notification will be rejected.");
                }
                Some(AlipayConfig {
                    app_id,
                    private_key: Secret::new(private_key),
                    public_key,
                    gateway_url: self.alipay_gateway_url,
                    min_topup: self.alipay_min_topup,
                })
            }
            (None, None) => None,
            _ => {
                warn!("Alipay configuration is incomplete (need both ALIPAY_APP_ID and ALIPAY_PRIVATE_KEY). Alipay is disabled.");
                None
            }
        };

        let wechat = match (non_empty(self.wechat_mch_id), non_empty(self.wechat_api_key)) {
            (Some(mch_id), Some(api_key)) => Some(WechatConfig {
                mch_id,
                app_id: non_empty(self.wechat_app_id),
                api_key: Secret::new(api_key),
                gateway_url: self.wechat_gateway_url,
                min_topup: self.wechat_min_topup,
            }),
            (None, None) => None,
            _ => {
                warn!("WeChat Pay configuration is incomplete (need both WECHAT_MCH_ID and WECHAT_API_V2_KEY). WeChat Pay is disabled.");
                None
            }
        };

        Ok(PaymentSettings {
            server_address: self.server_address,
            pricing: PricingPolicy {
                unit_price: self.price,
                conversion: UnitConversion::new(self.display_unit.into(), self.quota_per_unit),
                group_ratios,
                discounts,
            },
            user_groups,
            alipay,
            wechat,
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            ledger_timeout: Duration::from_secs(self.ledger_timeout_secs),
        })
    }
}
