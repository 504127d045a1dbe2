//! WeChat Pay API v2: `unifiedorder` (NATIVE) and payment result notifications.
//! Messages are flat XML documents signed with MD5 over the sorted fields and
//! the merchant API key.

use super::{PaymentGateway, PaymentRequest, canonical_query};
use crate::config::{Secret, WechatConfig};
use crate::domain::notification::{AckResponse, Acknowledgement, ProviderNotification};
use crate::domain::order::PaymentMethod;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use log::debug;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

pub const UNIFIED_ORDER_URL: &str = "https://api.mch.weixin.qq.com/pay/unifiedorder";
pub const TRADE_TYPE: &str = "NATIVE";
pub const SUCCESS: &str = "SUCCESS";
pub const FAIL: &str = "FAIL";

const NONCE_LEN: usize = 32;
const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

pub struct WechatGateway {
    mch_id: String,
    app_id: Option<String>,
    api_key: Secret<String>,
    gateway_url: String,
    min_topup: i64,
    http: reqwest::Client,
}

impl WechatGateway {
    pub fn new(config: &WechatConfig, http: reqwest::Client) -> Self {
        Self {
            mch_id: config.mch_id.clone(),
            app_id: config.app_id.clone(),
            api_key: config.api_key.clone(),
            gateway_url: config.gateway_url.clone(),
            min_topup: config.min_topup,
            http,
        }
    }

    /// Builds the signed field set for a unified order.
    pub fn unified_order_params(&self, request: &PaymentRequest<'_>) -> Result<BTreeMap<String, String>> {
        let total_fee = request
            .amount
            .to_cents()
            .ok_or_else(|| PaymentError::ProviderProtocolError(format!("amount {} out of range", request.amount)))?;

        let mut params: BTreeMap<String, String> = [
            ("mch_id", self.mch_id.as_str()),
            ("body", request.subject),
            ("out_trade_no", request.trade_no),
            ("spbill_create_ip", request.client_ip),
            ("notify_url", request.notify_url),
            ("trade_type", TRADE_TYPE),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        params.insert("nonce_str".into(), nonce());
        params.insert("total_fee".into(), total_fee.to_string());
        if let Some(app_id) = &self.app_id {
            params.insert("appid".into(), app_id.clone());
        }

        let signature = sign(&params, self.api_key.reveal());
        params.insert("sign".into(), signature);
        Ok(params)
    }
}

#[async_trait]
impl PaymentGateway for WechatGateway {
    fn payment_method(&self) -> PaymentMethod {
        PaymentMethod::Wechat
    }

    fn min_topup(&self) -> i64 {
        self.min_topup
    }

    async fn initiate_payment(&self, request: &PaymentRequest<'_>) -> Result<String> {
        let params = self.unified_order_params(request)?;
        let response = self
            .http
            .post(&self.gateway_url)
            .header(reqwest::header::CONTENT_TYPE, XML_CONTENT_TYPE)
            .body(build_xml(&params))
            .send()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("WeChat Pay: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaymentError::ProviderUnavailable(format!(
                "WeChat Pay responded with HTTP {status}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("WeChat Pay: {e}")))?;
        parse_unified_order_response(&body, self.api_key.reveal())
    }

    fn parse_notification(&self, raw: &[u8]) -> Result<ProviderNotification> {
        let fields = parse_xml_fields(raw).map_err(PaymentError::MalformedNotification)?;

        let trade_no = fields
            .get("out_trade_no")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| PaymentError::MalformedNotification("missing out_trade_no".into()))?;
        let return_code = fields.get("return_code").map(String::as_str).unwrap_or_default();
        let result_code = fields.get("result_code").map(String::as_str).unwrap_or_default();
        let succeeded = return_code == SUCCESS && result_code == SUCCESS;
        let status = if return_code == SUCCESS { result_code } else { return_code };

        Ok(ProviderNotification {
            payment_method: PaymentMethod::Wechat,
            trade_no,
            provider_trade_id: fields.get("transaction_id").cloned().unwrap_or_default(),
            status: status.to_string(),
            succeeded,
            fields,
        })
    }

    fn verify_authenticity(&self, fields: &BTreeMap<String, String>) -> bool {
        if fields.get("sign_type").is_some_and(|t| t != "MD5") {
            return false;
        }
        if fields.get("mch_id").is_some_and(|id| id != &self.mch_id) {
            debug!("WeChat notification addressed to another merchant");
            return false;
        }
        if let (Some(expected), Some(actual)) = (&self.app_id, fields.get("appid"))
            && expected != actual
        {
            debug!("WeChat notification addressed to another app id");
            return false;
        }
        fields
            .get("sign")
            .is_some_and(|given| signature_matches(fields, self.api_key.reveal(), given))
    }
}

/// MD5 over the canonical query of every non-empty field but `sign`, followed
/// by `&key=<api key>`.
fn digest(fields: &BTreeMap<String, String>, api_key: &str) -> [u8; 16] {
    let mut content = canonical_query(fields, &["sign"]);
    if !content.is_empty() {
        content.push('&');
    }
    content.push_str("key=");
    content.push_str(api_key);
    md5::compute(content.as_bytes()).0
}

/// MD5 signature in upper-case hex.
pub fn sign(fields: &BTreeMap<String, String>, api_key: &str) -> String {
    hex::encode_upper(digest(fields, api_key))
}

/// Compares `given` with the expected signature in constant time. Hex digits
/// may be in either case.
pub fn signature_matches(fields: &BTreeMap<String, String>, api_key: &str, given: &str) -> bool {
    let Ok(given) = hex::decode(given) else {
        return false;
    };
    digest(fields, api_key)[..].ct_eq(&given[..]).into()
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

/// Value of a field element while it is being read.
#[derive(Default)]
struct FieldValue {
    /// Every text node, verbatim.
    text: String,
    /// CDATA sections plus text nodes that are not pure whitespace.
    content: String,
    has_cdata: bool,
}

impl FieldValue {
    fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
        if !text.trim().is_empty() {
            self.content.push_str(text);
        }
    }

    fn push_cdata(&mut self, data: &str) {
        self.content.push_str(data);
        self.has_cdata = true;
    }

    /// Plain text values are kept exactly, since they are signed as sent.
    /// Whitespace around CDATA sections is layout.
    fn finish(self) -> String {
        if self.has_cdata { self.content } else { self.text }
    }
}

/// Reads a flat `<xml><key>value</key>...</xml>` document. Values may be plain
/// text or CDATA; nested elements below the first level are ignored.
pub fn parse_xml_fields(raw: &[u8]) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut reader = Reader::from_reader(raw);

    let mut fields = BTreeMap::new();
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut seen_root = false;
    let mut current: Option<(String, FieldValue)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                depth += 1;
                seen_root = true;
                if depth == 2 {
                    let name = String::from_utf8(e.name().as_ref().to_vec()).map_err(|e| e.to_string())?;
                    current = Some((name, FieldValue::default()));
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 {
                    let name = String::from_utf8(e.name().as_ref().to_vec()).map_err(|e| e.to_string())?;
                    fields.insert(name, String::new());
                }
                seen_root = true;
            }
            Ok(Event::Text(text)) => {
                if depth == 2
                    && let Some((_, value)) = current.as_mut()
                {
                    value.push_text(&text.unescape().map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::CData(data)) => {
                if depth == 2
                    && let Some((_, value)) = current.as_mut()
                {
                    let text = std::str::from_utf8(&data).map_err(|e| e.to_string())?;
                    value.push_cdata(text);
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2
                    && let Some((name, value)) = current.take()
                {
                    fields.insert(name, value.finish());
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(format!("invalid XML at position {}: {e}", reader.buffer_position()));
            }
        }
        buf.clear();
    }

    if !seen_root {
        return Err("empty document".into());
    }
    Ok(fields)
}

/// Serializes fields as a flat XML document with CDATA values.
pub fn build_xml(fields: &BTreeMap<String, String>) -> String {
    let mut xml = String::from("<xml>");
    for (key, value) in fields {
        xml.push_str(&format!(
            "<{key}><![CDATA[{}]]></{key}>",
            value.replace("]]>", "]]]]><![CDATA[>")
        ));
    }
    xml.push_str("</xml>");
    xml
}

/// Extracts `code_url` from a unified order response, checking its signature.
pub fn parse_unified_order_response(body: &[u8], api_key: &str) -> Result<String> {
    let fields = parse_xml_fields(body)
        .map_err(|e| PaymentError::ProviderProtocolError(format!("WeChat unifiedorder: {e}")))?;
    let field = |key: &str| fields.get(key).map(String::as_str).unwrap_or_default();

    if field("return_code") != SUCCESS {
        return Err(PaymentError::ProviderRejected(format!(
            "WeChat return_code {}: {}",
            field("return_code"),
            field("return_msg")
        )));
    }
    if let Some(given) = fields.get("sign")
        && !signature_matches(&fields, api_key, given)
    {
        return Err(PaymentError::ProviderProtocolError(
            "WeChat unifiedorder: response signature mismatch".into(),
        ));
    }
    if field("result_code") != SUCCESS {
        let detail = match field("err_code_des") {
            "" => field("err_code"),
            description => description,
        };
        return Err(PaymentError::ProviderRejected(format!("WeChat result_code {}: {detail}", field("result_code"))));
    }
    match field("code_url") {
        "" => Err(PaymentError::ProviderProtocolError(
            "WeChat unifiedorder: missing code_url".into(),
        )),
        code_url => Ok(code_url.to_string()),
    }
}

pub fn render_ack(ack: &Acknowledgement) -> AckResponse {
    let (code, message) = match ack {
        Acknowledgement::Success => (SUCCESS, "OK"),
        Acknowledgement::Failure(reason) => (FAIL, reason.as_str()),
    };
    let fields = BTreeMap::from([
        ("return_code".to_string(), code.to_string()),
        ("return_msg".to_string(), message.to_string()),
    ]);
    AckResponse {
        content_type: XML_CONTENT_TYPE,
        body: build_xml(&fields),
    }
}
