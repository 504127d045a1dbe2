use crate::domain::ports::QuotaLedger;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Serialize)]
struct CreditRequest {
    user_id: i64,
    quota: i64,
}

/// Credits quota through the balance service's HTTP API.
///
/// Each credit is one `POST` of `{"user_id": .., "quota": ..}` to the
/// configured endpoint; any non-2xx answer counts as a failed credit.
pub struct HttpQuotaLedger {
    client: Client,
    endpoint: Url,
}

impl HttpQuotaLedger {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| PaymentError::InvalidConfiguration(format!("ledger URL {endpoint}: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .user_agent("topup-reconciler")
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl QuotaLedger for HttpQuotaLedger {
    async fn credit(&self, user_id: i64, quota: i64) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&CreditRequest { user_id, quota })
            .send()
            .await
            .map_err(|e| PaymentError::LedgerCreditFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PaymentError::LedgerCreditFailed(format!(
            "ledger answered {status}: {body}"
        )))
    }
}
