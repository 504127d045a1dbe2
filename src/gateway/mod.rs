//! Provider-specific protocol handling.
//!
//! The set of providers is closed: [`ProviderGateway`] is the enum the rest of
//! the crate passes around, and [`PaymentGateway`] is the capability interface
//! both variants implement. Adding a provider means adding a variant.

pub mod alipay;
pub mod wechat;

use crate::config::PaymentSettings;
use crate::domain::money::Money;
use crate::domain::notification::{AckResponse, Acknowledgement, ProviderNotification};
use crate::domain::order::PaymentMethod;
use crate::error::{PaymentError, Result};
use alipay::AlipayGateway;
use async_trait::async_trait;
use std::collections::BTreeMap;
use wechat::WechatGateway;

/// Shown to the payer on the provider's checkout page.
pub const DEFAULT_SUBJECT: &str = "AI service top-up";

/// Everything a provider needs to register a payable transaction.
#[derive(Debug, Clone)]
pub struct PaymentRequest<'a> {
    pub trade_no: &'a str,
    pub amount: Money,
    pub notify_url: &'a str,
    pub client_ip: &'a str,
    pub subject: &'a str,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn payment_method(&self) -> PaymentMethod;

    /// Smallest top-up quantity this provider accepts, before unit conversion.
    fn min_topup(&self) -> i64;

    /// Registers a transaction with the provider and returns the handle shown to
    /// the payer (a QR code payload).
    async fn initiate_payment(&self, request: &PaymentRequest<'_>) -> Result<String>;

    /// Decodes a callback body. Does not check the signature.
    fn parse_notification(&self, raw: &[u8]) -> Result<ProviderNotification>;

    /// Checks the signature over the raw notification fields.
    fn verify_authenticity(&self, fields: &BTreeMap<String, String>) -> bool;
}

pub enum ProviderGateway {
    Alipay(AlipayGateway),
    Wechat(WechatGateway),
}

impl ProviderGateway {
    fn inner(&self) -> &dyn PaymentGateway {
        match self {
            ProviderGateway::Alipay(gateway) => gateway,
            ProviderGateway::Wechat(gateway) => gateway,
        }
    }
}

#[async_trait]
impl PaymentGateway for ProviderGateway {
    fn payment_method(&self) -> PaymentMethod {
        self.inner().payment_method()
    }

    fn min_topup(&self) -> i64 {
        self.inner().min_topup()
    }

    async fn initiate_payment(&self, request: &PaymentRequest<'_>) -> Result<String> {
        self.inner().initiate_payment(request).await
    }

    fn parse_notification(&self, raw: &[u8]) -> Result<ProviderNotification> {
        self.inner().parse_notification(raw)
    }

    fn verify_authenticity(&self, fields: &BTreeMap<String, String>) -> bool {
        self.inner().verify_authenticity(fields)
    }
}

/// Renders an acknowledgement in the provider's expected format.
///
/// Depends only on the payment method so that a callback for a provider that
/// is not configured can still be answered.
pub fn acknowledgement(method: PaymentMethod, ack: &Acknowledgement) -> AckResponse {
    match method {
        PaymentMethod::Alipay => alipay::render_ack(ack),
        PaymentMethod::Wechat => wechat::render_ack(ack),
    }
}

/// The configured providers, looked up by payment method.
#[derive(Default)]
pub struct Gateways {
    alipay: Option<ProviderGateway>,
    wechat: Option<ProviderGateway>,
}

impl Gateways {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every provider that has a configuration.
    pub fn from_settings(settings: &PaymentSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.provider_timeout)
            .build()
            .map_err(|e| PaymentError::InvalidConfiguration(format!("HTTP client: {e}")))?;

        let mut gateways = Self::new();
        if let Some(config) = &settings.alipay {
            gateways = gateways.with(ProviderGateway::Alipay(AlipayGateway::new(config, http.clone())?));
        }
        if let Some(config) = &settings.wechat {
            gateways = gateways.with(ProviderGateway::Wechat(WechatGateway::new(config, http)));
        }
        Ok(gateways)
    }

    pub fn with(mut self, gateway: ProviderGateway) -> Self {
        match gateway.payment_method() {
            PaymentMethod::Alipay => self.alipay = Some(gateway),
            PaymentMethod::Wechat => self.wechat = Some(gateway),
        }
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Result<&ProviderGateway> {
        let gateway = match method {
            PaymentMethod::Alipay => self.alipay.as_ref(),
            PaymentMethod::Wechat => self.wechat.as_ref(),
        };
        gateway.ok_or(PaymentError::ConfigurationMissing(method))
    }

    pub fn is_configured(&self, method: PaymentMethod) -> bool {
        self.get(method).is_ok()
    }
}

/// The string both providers sign: non-empty fields sorted by key, joined as
/// `k=v` pairs with `&`, skipping the `excluded` keys.
pub fn canonical_query(fields: &BTreeMap<String, String>, excluded: &[&str]) -> String {
    fields
        .iter()
        .filter(|(key, value)| !value.is_empty() && !excluded.contains(&key.as_str()))
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}
