//! HTTP surface: provider callbacks plus the purchase and quote endpoints.
//!
//! Callback endpoints always answer `200` with the provider's acknowledgement
//! format. User-facing endpoints answer `200` with a
//! `{"message": "success" | "error", "data": ...}` envelope.
//!
//! `user_id` is expected to be set by the authenticating proxy in front of this
//! server. Pricing groups are never taken from the request body.

use crate::application::reconciler::ReconciliationProcessor;
use crate::application::topup::{TopUpRequest, TopUpService};
use crate::domain::notification::Acknowledgement;
use crate::domain::order::PaymentMethod;
use crate::gateway::{Gateways, acknowledgement};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const FALLBACK_CLIENT_IP: &str = "127.0.0.1";

#[derive(Clone)]
pub struct AppState {
    pub topup: Arc<TopUpService>,
    pub reconciler: Arc<ReconciliationProcessor>,
    pub gateways: Arc<Gateways>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse<T> {
    pub message: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Response {
        Json(ApiResponse {
            message: "success".to_string(),
            data,
        })
        .into_response()
    }
}

impl ApiResponse<String> {
    pub fn error(reason: impl ToString) -> Response {
        Json(ApiResponse {
            message: "error".to_string(),
            data: reason.to_string(),
        })
        .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub user_id: i64,
    pub amount: i64,
    /// Must match the route when given.
    pub payment_method: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PayResponse {
    pub pay_url: String,
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub user_id: i64,
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub alipay: bool,
    pub wechat: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/{method}/notify", post(notify))
        .route("/api/{method}/pay", post(request_pay))
        .route("/api/{method}/amount", post(request_amount))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    ApiResponse::success(HealthResponse {
        alipay: state.gateways.is_configured(PaymentMethod::Alipay),
        wechat: state.gateways.is_configured(PaymentMethod::Wechat),
    })
}

async fn notify(State(state): State<AppState>, Path(method): Path<String>, body: Bytes) -> Response {
    let Ok(method) = method.parse::<PaymentMethod>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let ack = match state.gateways.get(method) {
        Ok(gateway) => state.reconciler.handle_notification(gateway, &body).await,
        Err(e) => {
            warn!("Dropping {method} notification: {e}");
            acknowledgement(method, &Acknowledgement::Failure(e.to_string()))
        }
    };
    ([(CONTENT_TYPE, ack.content_type)], ack.body).into_response()
}

async fn request_pay(
    State(state): State<AppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<PayRequest>, JsonRejection>,
) -> Response {
    let method = match method.parse::<PaymentMethod>() {
        Ok(method) => method,
        Err(e) => return ApiResponse::error(e),
    };
    let Ok(Json(payload)) = payload else {
        return ApiResponse::error("invalid request body");
    };
    if let Some(requested) = payload.payment_method.as_deref()
        && requested != method.as_str()
    {
        return ApiResponse::error(format!("Unsupported payment method: {requested}"));
    }

    let request = TopUpRequest {
        user_id: payload.user_id,
        amount: payload.amount,
        payment_method: method,
        client_ip: client_ip(&headers),
    };
    match state.topup.request_payment(request).await {
        Ok(handle) => ApiResponse::success(PayResponse {
            pay_url: handle.pay_url,
            order_id: handle.trade_no,
        }),
        Err(e) => ApiResponse::error(e),
    }
}

async fn request_amount(
    State(state): State<AppState>,
    Path(method): Path<String>,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Response {
    let method = match method.parse::<PaymentMethod>() {
        Ok(method) => method,
        Err(e) => return ApiResponse::error(e),
    };
    let Ok(Json(payload)) = payload else {
        return ApiResponse::error("invalid request body");
    };
    match state.topup.quote(method, payload.user_id, payload.amount).await {
        Ok(money) => ApiResponse::success(money.to_string()),
        Err(e) => ApiResponse::error(e),
    }
}

/// Payer address as reported by the reverse proxy.
fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    header("x-real-ip")
        .or_else(|| header("x-forwarded-for").and_then(|value| value.split(',').next()).map(str::trim))
        .unwrap_or(FALLBACK_CLIENT_IP)
        .to_string()
}
