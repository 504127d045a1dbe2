//! Alipay open platform: `alipay.trade.precreate` and asynchronous notifications,
//! both signed RSA2 (SHA256withRSA, PKCS#1 v1.5).

use super::{PaymentGateway, PaymentRequest, canonical_query};
use crate::config::AlipayConfig;
use crate::domain::notification::{AckResponse, Acknowledgement, ProviderNotification};
use crate::domain::order::PaymentMethod;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{FixedOffset, Utc};
use log::{debug, warn};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use serde_json::value::RawValue;
use sha2::Sha256;
use std::collections::BTreeMap;

pub const PRODUCTION_GATEWAY: &str = "https://openapi.alipay.com/gateway.do";
pub const PRECREATE_METHOD: &str = "alipay.trade.precreate";
pub const SIGN_TYPE: &str = "RSA2";
/// Response code for an accepted request.
pub const CODE_SUCCESS: &str = "10000";
pub const SUCCESS_STATUSES: [&str; 2] = ["TRADE_SUCCESS", "TRADE_FINISHED"];

const ACK_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
/// Alipay timestamps are Beijing time.
const BEIJING_OFFSET_SECS: i32 = 8 * 3600;

pub struct AlipayGateway {
    app_id: String,
    signing_key: SigningKey<Sha256>,
    verifying_key: Option<VerifyingKey<Sha256>>,
    gateway_url: String,
    min_topup: i64,
    http: reqwest::Client,
}

impl AlipayGateway {
    pub fn new(config: &AlipayConfig, http: reqwest::Client) -> Result<Self> {
        let private_key = parse_private_key(config.private_key.reveal())?;
        let verifying_key = config
            .public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?
            .map(VerifyingKey::<Sha256>::new);

        Ok(Self {
            app_id: config.app_id.clone(),
            signing_key: SigningKey::<Sha256>::new(private_key),
            verifying_key,
            gateway_url: config.gateway_url.clone(),
            min_topup: config.min_topup,
            http,
        })
    }

    /// Builds the signed form for a precreate call.
    pub fn precreate_params(&self, request: &PaymentRequest<'_>) -> Result<BTreeMap<String, String>> {
        let biz_content = serde_json::json!({
            "out_trade_no": request.trade_no,
            "total_amount": request.amount.to_string(),
            "subject": request.subject,
        });
        let offset = FixedOffset::east_opt(BEIJING_OFFSET_SECS)
            .ok_or_else(|| PaymentError::InvalidConfiguration("invalid Alipay timezone".into()))?;
        let timestamp = Utc::now()
            .with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let mut params: BTreeMap<String, String> = [
            ("app_id", self.app_id.as_str()),
            ("method", PRECREATE_METHOD),
            ("format", "JSON"),
            ("charset", "utf-8"),
            ("sign_type", SIGN_TYPE),
            ("version", "1.0"),
            ("notify_url", request.notify_url),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        params.insert("timestamp".into(), timestamp);
        params.insert("biz_content".into(), biz_content.to_string());

        // Requests sign everything but `sign` itself, `sign_type` included
        let signature = sign(&self.signing_key, &canonical_query(&params, &["sign"]))?;
        params.insert("sign".into(), signature);
        Ok(params)
    }
}

#[async_trait]
impl PaymentGateway for AlipayGateway {
    fn payment_method(&self) -> PaymentMethod {
        PaymentMethod::Alipay
    }

    fn min_topup(&self) -> i64 {
        self.min_topup
    }

    async fn initiate_payment(&self, request: &PaymentRequest<'_>) -> Result<String> {
        let params = self.precreate_params(request)?;
        let response = self
            .http
            .post(&self.gateway_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("Alipay: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::ProviderUnavailable(format!(
                "Alipay responded with HTTP {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("Alipay: {e}")))?;
        parse_precreate_response(&body, self.verifying_key.as_ref())
    }

    fn parse_notification(&self, raw: &[u8]) -> Result<ProviderNotification> {
        let fields: BTreeMap<String, String> = url::form_urlencoded::parse(raw)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let trade_no = required(&fields, "out_trade_no")?;
        let status = required(&fields, "trade_status")?;
        let provider_trade_id = fields.get("trade_no").cloned().unwrap_or_default();
        let succeeded = SUCCESS_STATUSES.contains(&status.as_str());

        Ok(ProviderNotification {
            payment_method: PaymentMethod::Alipay,
            trade_no,
            provider_trade_id,
            status,
            succeeded,
            fields,
        })
    }

    fn verify_authenticity(&self, fields: &BTreeMap<String, String>) -> bool {
        let Some(verifying_key) = &self.verifying_key else {
            warn!("Alipay public key is not configured, rejecting notification");
            return false;
        };
        if fields.get("sign_type").is_some_and(|t| t != SIGN_TYPE) {
            return false;
        }
        if fields.get("app_id").is_some_and(|id| id != &self.app_id) {
            debug!("Alipay notification addressed to another app id");
            return false;
        }
        let Some(signature) = fields.get("sign") else {
            return false;
        };
        verify(
            verifying_key,
            &canonical_query(fields, &["sign", "sign_type"]),
            signature,
        )
    }
}

fn required(fields: &BTreeMap<String, String>, key: &str) -> Result<String> {
    fields
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| PaymentError::MalformedNotification(format!("missing {key}")))
}

#[derive(Debug, Deserialize)]
struct PrecreateEnvelope<'a> {
    #[serde(borrow)]
    alipay_trade_precreate_response: Option<&'a RawValue>,
    #[serde(borrow)]
    error_response: Option<&'a RawValue>,
    sign: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrecreateResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    sub_msg: Option<String>,
    #[serde(default)]
    qr_code: Option<String>,
}

fn protocol_error(detail: impl std::fmt::Display) -> PaymentError {
    PaymentError::ProviderProtocolError(format!("Alipay precreate: {detail}"))
}

/// Extracts the QR code payload from a precreate response body.
///
/// With a platform key, the response object is verified exactly as it appears
/// in the body. Unsigned answers are only accepted as rejections.
pub fn parse_precreate_response(body: &str, verifying_key: Option<&VerifyingKey<Sha256>>) -> Result<String> {
    let envelope: PrecreateEnvelope<'_> = serde_json::from_str(body).map_err(protocol_error)?;
    let raw = envelope
        .alipay_trade_precreate_response
        .or(envelope.error_response)
        .ok_or_else(|| protocol_error("empty response"))?;
    let response: PrecreateResponse = serde_json::from_str(raw.get()).map_err(protocol_error)?;

    let verified = match (verifying_key, envelope.sign.as_deref()) {
        (Some(key), Some(signature)) => {
            if !verify(key, raw.get(), signature) {
                return Err(protocol_error("response signature mismatch"));
            }
            true
        }
        (Some(_), None) => false,
        (None, _) => true,
    };

    if response.code != CODE_SUCCESS {
        let detail = response.sub_msg.unwrap_or(response.msg);
        return Err(PaymentError::ProviderRejected(format!(
            "Alipay code {}: {detail}",
            response.code
        )));
    }
    if !verified {
        return Err(protocol_error("unsigned response"));
    }
    response
        .qr_code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| protocol_error("missing qr_code"))
}

pub fn render_ack(ack: &Acknowledgement) -> AckResponse {
    let body = if ack.is_success() { "success" } else { "fail" };
    AckResponse {
        content_type: ACK_CONTENT_TYPE,
        body: body.to_string(),
    }
}

/// Signs `content` and returns the base64 signature.
pub fn sign(key: &SigningKey<Sha256>, content: &str) -> Result<String> {
    let signature = key
        .try_sign(content.as_bytes())
        .map_err(|e| PaymentError::InvalidConfiguration(format!("Alipay signing failed: {e}")))?;
    Ok(STANDARD.encode(signature.to_bytes()))
}

pub fn verify(key: &VerifyingKey<Sha256>, content: &str, signature: &str) -> bool {
    let Ok(bytes) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(content.as_bytes(), &signature).is_ok()
}

fn strip_whitespace(key: &str) -> String {
    key.chars().filter(|c| !c.is_whitespace()).collect()
}

fn decode_der(key: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(strip_whitespace(key))
        .map_err(|e| PaymentError::InvalidConfiguration(format!("Alipay key is not base64: {e}")))
}

/// Accepts PKCS#8 or PKCS#1, either PEM or the bare base64 DER the Alipay
/// console hands out.
pub fn parse_private_key(key: &str) -> Result<RsaPrivateKey> {
    let key = key.trim();
    let parsed = if key.starts_with("-----BEGIN") {
        RsaPrivateKey::from_pkcs8_pem(key)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key).map_err(|e| e.to_string()))
    } else {
        let der = decode_der(key)?;
        RsaPrivateKey::from_pkcs8_der(&der)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der).map_err(|e| e.to_string()))
    };
    parsed.map_err(|e| PaymentError::InvalidConfiguration(format!("Alipay private key: {e}")))
}

pub fn parse_public_key(key: &str) -> Result<RsaPublicKey> {
    let key = key.trim();
    let parsed = if key.starts_with("-----BEGIN") {
        RsaPublicKey::from_public_key_pem(key)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(key).map_err(|e| e.to_string()))
    } else {
        let der = decode_der(key)?;
        RsaPublicKey::from_public_key_der(&der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(&der).map_err(|e| e.to_string()))
    };
    parsed.map_err(|e| PaymentError::InvalidConfiguration(format!("Alipay public key: {e}")))
}
