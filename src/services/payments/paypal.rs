//! PayPal Orders v2: create an order with an approval link, capture it when the
//! shopper returns.

use super::{
    gateway_error, read_json, AccessTokenCache, GatewayCallback, GatewayHandle, OutcomeStatus,
    PaymentGateway, PaymentMethod, PaymentOutcome, PaymentRequest,
};
use crate::cache::CacheBackend;
use crate::config::{PaymentsConfig, PaypalConfig};
use crate::errors::ServiceError;
use crate::services::payments::format_amount;
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const NAME: &str = "PayPal";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    id: String,
    #[serde(default)]
    links: Vec<Link>,
}

pub struct PaypalGateway {
    config: PaypalConfig,
    currency: String,
    return_url: String,
    cancel_url: String,
    client: reqwest::Client,
    token: AccessTokenCache,
}

impl PaypalGateway {
    pub fn new(
        config: PaypalConfig,
        payments: &PaymentsConfig,
        client: reqwest::Client,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        let currency = config
            .currency
            .clone()
            .unwrap_or_else(|| payments.currency.clone());
        Self {
            token: AccessTokenCache::new(
                "paypal:access_token",
                cache,
                payments.token_refresh_margin(),
            ),
            currency,
            return_url: payments.return_url.clone(),
            cancel_url: payments.cancel_url.clone(),
            config,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        self.token
            .get_or_refresh(|| async {
                let response = self
                    .client
                    .post(self.url("/v1/oauth2/token"))
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .header(header::ACCEPT, "application/json")
                    .form(&[("grant_type", "client_credentials")])
                    .send()
                    .await?;
                let body: TokenResponse = serde_json::from_value(read_json(NAME, response).await?)?;
                Ok((body.access_token, Duration::from_secs(body.expires_in)))
            })
            .await
    }

    async fn capture(&self, paypal_order_id: &str) -> Result<Value, ServiceError> {
        let url = self.url(&format!("/v2/checkout/orders/{}/capture", paypal_order_id));
        let request_id = format!("capture-{}", paypal_order_id);
        let response = self
            .token
            .send_authorized(
                || self.access_token(),
                |token| {
                    self.client
                        .post(url.as_str())
                        .bearer_auth(token)
                        .header("PayPal-Request-Id", request_id.as_str())
                        .header(header::CONTENT_TYPE, "application/json")
                        .body("{}")
                        .send()
                },
            )
            .await?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let status = response.status();
            let text = response.text().await?;
            if already_captured(&text) {
                info!(paypal_order_id, "order already captured; fetching current state");
                return self.fetch_order(paypal_order_id).await;
            }
            return Err(gateway_error(NAME, status, &text));
        }

        read_json(NAME, response).await
    }

    async fn fetch_order(&self, paypal_order_id: &str) -> Result<Value, ServiceError> {
        let url = self.url(&format!("/v2/checkout/orders/{}", paypal_order_id));
        let response = self
            .token
            .send_authorized(
                || self.access_token(),
                |token| self.client.get(url.as_str()).bearer_auth(token).send(),
            )
            .await?;
        read_json(NAME, response).await
    }
}

fn already_captured(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("details").and_then(Value::as_array).cloned())
        .map(|details| {
            details
                .iter()
                .any(|d| d.get("issue").and_then(Value::as_str) == Some("ORDER_ALREADY_CAPTURED"))
        })
        .unwrap_or(false)
}

/// PayPal order id from the return redirect (`?token=`) or a JSON body.
fn callback_order_id(callback: &GatewayCallback) -> Option<String> {
    match callback {
        GatewayCallback::Body { .. } => callback.json().and_then(|body| {
            ["order_id", "orderID", "token"]
                .iter()
                .find_map(|key| body.get(*key).and_then(super::json_id))
        }),
        GatewayCallback::Query(_) => callback
            .query("token")
            .or_else(|| callback.query("order_id"))
            .map(str::to_string),
    }
}

/// Maps a capture (or order) representation to an outcome.
fn outcome_from_capture(paypal_order_id: &str, body: &Value) -> Option<PaymentOutcome> {
    let status = match body.get("status").and_then(Value::as_str) {
        Some("COMPLETED") => OutcomeStatus::Success,
        _ => OutcomeStatus::Failed,
    };
    let gateway_order_id = body
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(paypal_order_id)
        .to_string();
    let capture_id = body
        .pointer("/purchase_units/0/payments/captures/0/id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| gateway_order_id.clone());

    PaymentOutcome::new(Some(gateway_order_id), Some(capture_id), status)
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Paypal
    }

    fn provider_name(&self) -> Option<&'static str> {
        Some(NAME)
    }

    #[instrument(skip(self, request), fields(order_id = %request.order.id))]
    async fn initiate(&self, request: &PaymentRequest<'_>) -> Result<GatewayHandle, ServiceError> {
        let order_id = request.order.id.to_string();
        // PayPal deduplicates creates that carry the same request id.
        let request_id = format!("create-{}", order_id);

        let body = json!({
            "intent": "CAPTURE",
            "payment_source": {
                "paypal": {
                    "experience_context": {
                        "payment_method_preference": "IMMEDIATE_PAYMENT_REQUIRED",
                        "landing_page": "LOGIN",
                        "shipping_preference": "GET_FROM_FILE",
                        "user_action": "PAY_NOW",
                        "return_url": self.return_url,
                        "cancel_url": self.cancel_url,
                    }
                }
            },
            "purchase_units": [{
                "reference_id": order_id,
                "custom_id": order_id,
                "amount": {
                    "currency_code": self.currency,
                    "value": format_amount(request.amount),
                }
            }]
        });

        let url = self.url("/v2/checkout/orders");
        let response = self
            .token
            .send_authorized(
                || self.access_token(),
                |token| {
                    self.client
                        .post(url.as_str())
                        .bearer_auth(token)
                        .header("PayPal-Request-Id", request_id.as_str())
                        .header("Prefer", "return=representation")
                        .json(&body)
                        .send()
                },
            )
            .await?;
        let created: CreatedOrder = serde_json::from_value(read_json(NAME, response).await?)?;

        let approve = created
            .links
            .into_iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href);
        if approve.is_none() {
            warn!(paypal_order_id = %created.id, "order created without an approval link");
        }

        info!(paypal_order_id = %created.id, "paypal order created");
        Ok(GatewayHandle {
            redirect_url: approve,
            external_order_id: Some(created.id),
            ..GatewayHandle::pending()
        })
    }

    #[instrument(skip_all)]
    async fn reconcile(
        &self,
        callback: &GatewayCallback,
    ) -> Result<Option<PaymentOutcome>, ServiceError> {
        let Some(paypal_order_id) = callback_order_id(callback) else {
            return Ok(None);
        };
        let captured = self.capture(&paypal_order_id).await?;
        Ok(outcome_from_capture(&paypal_order_id, &captured))
    }
}
