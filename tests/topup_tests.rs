mod common;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use common::{
    Harness, QUOTA_PER_UNIT, UNREACHABLE_URL, VIP_USER, WECHAT_API_KEY, alipay_keys, alipay_notification,
    wechat_notification,
};
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use topup_reconciler::application::reconciler::ReconcileOutcome;
use topup_reconciler::application::topup::TopUpRequest;
use topup_reconciler::domain::order::{OrderStatus, PaymentMethod};
use topup_reconciler::error::PaymentError;
use topup_reconciler::gateway::{alipay, canonical_query, wechat};

type Received = Arc<Mutex<Vec<BTreeMap<String, String>>>>;

/// Starts a fake provider endpoint and returns its URL.
async fn spawn_provider(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/gateway")
}

async fn fake_wechat(State(received): State<Received>, body: Bytes) -> String {
    let request = wechat::parse_xml_fields(&body).unwrap();
    let valid = wechat::sign(&request, WECHAT_API_KEY) == request["sign"];
    received.lock().await.push(request);

    let mut response: BTreeMap<String, String> = if valid {
        [
            ("return_code", "SUCCESS"),
            ("result_code", "SUCCESS"),
            ("trade_type", "NATIVE"),
            ("code_url", "weixin://wxpay/bizpayurl?pr=fake"),
        ]
    } else {
        [
            ("return_code", "SUCCESS"),
            ("result_code", "FAIL"),
            ("err_code", "SIGNERROR"),
            ("err_code_des", "bad signature"),
        ]
    }
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let signature = wechat::sign(&response, WECHAT_API_KEY);
    response.insert("sign".into(), signature);
    wechat::build_xml(&response)
}

async fn fake_alipay(State(received): State<Received>, body: Bytes) -> String {
    let request: BTreeMap<String, String> = url::form_urlencoded::parse(&body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let merchant = alipay::parse_private_key(&alipay_keys().merchant_pem).unwrap();
    let key = VerifyingKey::<Sha256>::new(merchant.to_public_key());
    let valid = alipay::verify(&key, &canonical_query(&request, &["sign"]), &request["sign"]);
    received.lock().await.push(request);

    if valid {
        let response = r#"{"code":"10000","msg":"Success","qr_code":"https://qr.alipay.com/fake"}"#;
        let platform = SigningKey::<Sha256>::new(alipay_keys().platform.clone());
        let signature = alipay::sign(&platform, response).unwrap();
        format!(r#"{{"alipay_trade_precreate_response":{response},"sign":"{signature}"}}"#)
    } else {
        r#"{"alipay_trade_precreate_response":{"code":"40002","msg":"Invalid Arguments","sub_msg":"bad signature"}}"#.to_string()
    }
}

fn request(amount: i64, method: PaymentMethod) -> TopUpRequest {
    TopUpRequest {
        user_id: VIP_USER,
        amount,
        payment_method: method,
        client_ip: "203.0.113.7".into(),
    }
}

#[tokio::test]
async fn test_wechat_purchase_then_notification() {
    let received = Received::default();
    let url = spawn_provider(
        Router::new()
            .route("/gateway", post(fake_wechat))
            .with_state(received.clone()),
    )
    .await;
    let harness = Harness::new(UNREACHABLE_URL, &url);

    let handle = harness
        .topup
        .request_payment(request(500, PaymentMethod::Wechat))
        .await
        .unwrap();
    assert_eq!(handle.pay_url, "weixin://wxpay/bizpayurl?pr=fake");

    let sent = received.lock().await[0].clone();
    assert_eq!(sent["out_trade_no"], handle.trade_no);
    // 500 units, vip ratio 1.2, tier discount 0.9
    assert_eq!(sent["total_fee"], "54000");
    assert_eq!(sent["spbill_create_ip"], "203.0.113.7");
    assert_eq!(sent["notify_url"], "https://pay.example.com/api/wechat/notify");

    let order = harness.order(&handle.trade_no).await;
    assert!(order.is_pending());
    assert_eq!(order.money().to_string(), "540.00");

    let outcome = harness
        .processor
        .reconcile_payload(
            harness.gateway(PaymentMethod::Wechat),
            &wechat_notification(&handle.trade_no, "SUCCESS"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Credited { quota: 500 * QUOTA_PER_UNIT });
    assert_eq!(harness.order(&handle.trade_no).await.status(), OrderStatus::Success);
}

#[tokio::test]
async fn test_alipay_purchase_then_notification() {
    let received = Received::default();
    let url = spawn_provider(
        Router::new()
            .route("/gateway", post(fake_alipay))
            .with_state(received.clone()),
    )
    .await;
    let harness = Harness::new(&url, UNREACHABLE_URL);

    let handle = harness
        .topup
        .request_payment(request(100, PaymentMethod::Alipay))
        .await
        .unwrap();
    assert_eq!(handle.pay_url, "https://qr.alipay.com/fake");

    let sent = received.lock().await[0].clone();
    assert_eq!(sent["method"], "alipay.trade.precreate");
    assert!(sent["biz_content"].contains(&handle.trade_no));
    assert!(sent["biz_content"].contains("\"total_amount\":\"120.00\""));

    let ack = harness
        .processor
        .handle_notification(
            harness.gateway(PaymentMethod::Alipay),
            &alipay_notification(&handle.trade_no, "TRADE_SUCCESS"),
        )
        .await;
    assert_eq!(ack.body, "success");
    assert_eq!(harness.ledger.balance(VIP_USER).await, 100 * QUOTA_PER_UNIT);
}

#[tokio::test]
async fn test_provider_rejection_is_reported() {
    // Signed with another key, so the fake provider rejects the call
    let received = Received::default();
    let url = spawn_provider(
        Router::new()
            .route("/gateway", post(fake_wechat))
            .with_state(received.clone()),
    )
    .await;
    let wechat = topup_reconciler::config::WechatConfig {
        api_key: topup_reconciler::config::Secret::new("another-key".into()),
        ..common::wechat_config(&url)
    };
    let gateways = topup_reconciler::gateway::Gateways::new().with(
        topup_reconciler::gateway::ProviderGateway::Wechat(wechat::WechatGateway::new(
            &wechat,
            reqwest::Client::new(),
        )),
    );
    let harness = Harness::offline();
    let service = topup_reconciler::application::topup::TopUpService::new(
        harness.orders.clone(),
        harness.users.clone(),
        Arc::new(gateways),
        common::pricing(),
        "https://pay.example.com",
    );

    let result = service.request_payment(request(10, PaymentMethod::Wechat)).await;
    // The response is signed with the real key, which this client cannot check either
    assert!(matches!(
        result,
        Err(PaymentError::ProviderProtocolError(_)) | Err(PaymentError::ProviderRejected(_))
    ));
    assert_eq!(received.lock().await.len(), 1);
}

#[tokio::test]
async fn test_below_minimum_creates_no_order() {
    let harness = Harness::offline();
    let result = harness
        .topup
        .request_payment(request(0, PaymentMethod::Alipay))
        .await;
    assert!(matches!(result, Err(PaymentError::BelowMinimumTopUp { minimum: 1 })));
    assert!(harness.orders.is_empty().await);
}

#[tokio::test]
async fn test_unreachable_provider() {
    let harness = Harness::offline();
    let result = harness
        .topup
        .request_payment(request(10, PaymentMethod::Wechat))
        .await;
    assert!(matches!(result, Err(PaymentError::ProviderUnavailable(_))));
}

#[tokio::test]
async fn test_quote_matches_order_money() {
    let harness = Harness::offline();
    let quote = harness.topup.quote(PaymentMethod::Alipay, VIP_USER, 500).await.unwrap();
    assert_eq!(quote.to_string(), "540.00");
    let plain = harness.topup.quote(PaymentMethod::Alipay, 1, 100).await.unwrap();
    assert_eq!(plain.to_string(), "100.00");

    harness.users.assign(1, "staff").await;
    let staff = harness.topup.quote(PaymentMethod::Alipay, 1, 100).await.unwrap();
    assert_eq!(staff.to_string(), "50.00");
}
