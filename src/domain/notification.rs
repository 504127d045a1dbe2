use crate::domain::order::PaymentMethod;
use std::collections::BTreeMap;

/// A provider's payment notification, decoded into one shape for both providers.
///
/// Lives for one reconciliation call and is never persisted. `fields` keeps every
/// decoded field, including the signature, because authenticity is checked
/// against the raw values rather than the typed ones.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderNotification {
    pub payment_method: PaymentMethod,
    pub trade_no: String,
    /// The provider's own transaction id.
    pub provider_trade_id: String,
    /// Provider status indicator as received, e.g. `TRADE_SUCCESS`.
    pub status: String,
    /// Whether `status` is one of the provider's final-success codes.
    pub succeeded: bool,
    pub fields: BTreeMap<String, String>,
}

/// What the provider is told once a notification has been handled.
///
/// A `Failure` makes the provider redeliver later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    Success,
    Failure(String),
}

impl Acknowledgement {
    pub fn is_success(&self) -> bool {
        matches!(self, Acknowledgement::Success)
    }
}

/// A rendered acknowledgement, ready for the transport to write back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    pub content_type: &'static str,
    pub body: String,
}
