#![allow(dead_code)]

use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rust_decimal_macros::dec;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use topup_reconciler::application::reconciler::ReconciliationProcessor;
use topup_reconciler::application::topup::TopUpService;
use topup_reconciler::config::{AlipayConfig, Secret, WechatConfig};
use topup_reconciler::domain::money::Money;
use topup_reconciler::domain::order::{PaymentMethod, TopUpOrder};
use topup_reconciler::domain::ports::OrderStore;
use topup_reconciler::domain::pricing::{DiscountTable, GroupRatio, PricingPolicy, QuotaDisplayType, UnitConversion};
use topup_reconciler::gateway::alipay::{self, AlipayGateway};
use topup_reconciler::gateway::wechat::{self, WechatGateway};
use topup_reconciler::gateway::{Gateways, ProviderGateway, canonical_query};
use topup_reconciler::infrastructure::in_memory::{InMemoryOrderStore, InMemoryQuotaLedger, InMemoryUserGroups};

pub const ALIPAY_APP_ID: &str = "2021000000000001";
pub const WECHAT_MCH_ID: &str = "10000100";
pub const WECHAT_API_KEY: &str = "192006250b4c09247ec02edce69f6a2d";
pub const QUOTA_PER_UNIT: i64 = 500_000;
/// Assigned to the "vip" group by the harness; every other user is "default".
pub const VIP_USER: i64 = 11;
/// Nothing listens on the discard port, so provider calls fail immediately.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:9/gateway";

pub struct AlipayKeys {
    pub merchant_pem: String,
    pub platform: RsaPrivateKey,
    pub platform_public_pem: String,
}

/// Key pairs are slow to generate, so every test in a binary shares one set.
pub fn alipay_keys() -> &'static AlipayKeys {
    static KEYS: OnceLock<AlipayKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let merchant = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let platform = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        AlipayKeys {
            merchant_pem: merchant.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            platform_public_pem: platform
                .to_public_key()
                .to_public_key_pem(LineEnding::LF)
                .unwrap(),
            platform,
        }
    })
}

pub fn alipay_config(gateway_url: &str) -> AlipayConfig {
    AlipayConfig {
        app_id: ALIPAY_APP_ID.to_string(),
        private_key: Secret::new(alipay_keys().merchant_pem.clone()),
        public_key: Some(alipay_keys().platform_public_pem.clone()),
        gateway_url: gateway_url.to_string(),
        min_topup: 1,
    }
}

pub fn wechat_config(gateway_url: &str) -> WechatConfig {
    WechatConfig {
        mch_id: WECHAT_MCH_ID.to_string(),
        app_id: None,
        api_key: Secret::new(WECHAT_API_KEY.to_string()),
        gateway_url: gateway_url.to_string(),
        min_topup: 1,
    }
}

pub fn gateways(alipay_url: &str, wechat_url: &str) -> Gateways {
    let http = reqwest::Client::new();
    Gateways::new()
        .with(ProviderGateway::Alipay(
            AlipayGateway::new(&alipay_config(alipay_url), http.clone()).unwrap(),
        ))
        .with(ProviderGateway::Wechat(WechatGateway::new(
            &wechat_config(wechat_url),
            http,
        )))
}

pub fn pricing() -> PricingPolicy {
    PricingPolicy {
        unit_price: dec!(1.00),
        conversion: UnitConversion::new(QuotaDisplayType::Currency, QUOTA_PER_UNIT.into()),
        group_ratios: GroupRatio::new()
            .with_group("vip", dec!(1.2))
            .with_group("staff", dec!(0.5)),
        discounts: DiscountTable::new().with_tier(500, dec!(0.9)),
    }
}

/// Everything a reconciliation test needs, wired against in-memory adapters.
pub struct Harness {
    pub orders: Arc<InMemoryOrderStore>,
    pub ledger: Arc<InMemoryQuotaLedger>,
    pub users: Arc<InMemoryUserGroups>,
    pub gateways: Arc<Gateways>,
    pub processor: Arc<ReconciliationProcessor>,
    pub topup: Arc<TopUpService>,
}

impl Harness {
    pub fn new(alipay_url: &str, wechat_url: &str) -> Self {
        let orders = Arc::new(InMemoryOrderStore::new());
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        let users = Arc::new(InMemoryUserGroups::from(HashMap::from([(
            VIP_USER,
            "vip".to_string(),
        )])));
        let gateways = Arc::new(gateways(alipay_url, wechat_url));
        let processor = Arc::new(ReconciliationProcessor::new(
            orders.clone(),
            ledger.clone(),
            pricing().conversion,
        ));
        let topup = Arc::new(TopUpService::new(
            orders.clone(),
            users.clone(),
            gateways.clone(),
            pricing(),
            "https://pay.example.com",
        ));
        Self {
            orders,
            ledger,
            users,
            gateways,
            processor,
            topup,
        }
    }

    pub fn offline() -> Self {
        Self::new(UNREACHABLE_URL, UNREACHABLE_URL)
    }

    pub fn gateway(&self, method: PaymentMethod) -> &ProviderGateway {
        self.gateways.get(method).unwrap()
    }

    /// Stores a pending order and returns its trade reference.
    pub async fn pending_order(&self, user_id: i64, amount: i64, method: PaymentMethod) -> String {
        let money = pricing().payable(amount, "default");
        let order = TopUpOrder::new(user_id, amount, money, method);
        let trade_no = order.trade_no().to_string();
        self.orders.insert(order).await.unwrap();
        trade_no
    }

    pub async fn order(&self, trade_no: &str) -> TopUpOrder {
        self.orders.find_by_trade_no(trade_no).await.unwrap().unwrap()
    }
}

fn to_fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Alipay notification form fields, signed with the platform key.
pub fn alipay_fields(trade_no: &str, status: &str, total: Money) -> BTreeMap<String, String> {
    let total = total.to_string();
    let mut fields = to_fields(&[
        ("app_id", ALIPAY_APP_ID),
        ("notify_type", "trade_status_sync"),
        ("out_trade_no", trade_no),
        ("trade_no", "2024010122001400000000000001"),
        ("trade_status", status),
        ("total_amount", total.as_str()),
        ("sign_type", "RSA2"),
    ]);
    let key = SigningKey::<Sha256>::new(alipay_keys().platform.clone());
    let signature = alipay::sign(&key, &canonical_query(&fields, &["sign", "sign_type"])).unwrap();
    fields.insert("sign".into(), signature);
    fields
}

pub fn encode_form(fields: &BTreeMap<String, String>) -> Vec<u8> {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
        .into_bytes()
}

pub fn alipay_notification(trade_no: &str, status: &str) -> Vec<u8> {
    encode_form(&alipay_fields(trade_no, status, Money::round(dec!(100))))
}

pub fn wechat_fields(trade_no: &str, result_code: &str) -> BTreeMap<String, String> {
    let mut fields = to_fields(&[
        ("mch_id", WECHAT_MCH_ID),
        ("nonce_str", "5K8264ILTKCH16CQ2502SI8ZNMTM67VS"),
        ("out_trade_no", trade_no),
        ("transaction_id", "4200000000202401010000000001"),
        ("total_fee", "10000"),
        ("trade_type", "NATIVE"),
        ("return_code", "SUCCESS"),
        ("result_code", result_code),
    ]);
    let signature = wechat::sign(&fields, WECHAT_API_KEY);
    fields.insert("sign".into(), signature);
    fields
}

pub fn wechat_notification(trade_no: &str, result_code: &str) -> Vec<u8> {
    wechat::build_xml(&wechat_fields(trade_no, result_code)).into_bytes()
}
