//! Stripe Checkout Sessions. Results arrive only as signed webhooks.

use super::{
    read_json, to_minor_units, GatewayCallback, GatewayHandle, OutcomeStatus, PaymentGateway,
    PaymentMethod, PaymentOutcome, PaymentRequest,
};
use crate::config::{PaymentsConfig, StripeConfig};
use crate::errors::ServiceError;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{error, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

const NAME: &str = "Stripe";
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

pub struct StripeGateway {
    config: StripeConfig,
    currency: String,
    frontend_url: String,
    client: reqwest::Client,
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>]`) against the raw body.
pub fn verify_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| ServiceError::InvalidSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(ServiceError::InvalidSignature("missing v1 signature".into()));
    }
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ServiceError::InvalidSignature("malformed timestamp".into()))?;
    if (now - ts).unsigned_abs() > tolerance_secs {
        return Err(ServiceError::InvalidSignature(
            "timestamp outside tolerance".into(),
        ));
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid webhook secret: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(ServiceError::InvalidSignature("signature mismatch".into()))
}

fn metadata_order_id(object: &Value) -> Option<String> {
    object
        .pointer("/metadata/order_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

impl StripeGateway {
    pub fn new(config: StripeConfig, payments: &PaymentsConfig, client: reqwest::Client) -> Self {
        let currency = config
            .currency
            .clone()
            .unwrap_or_else(|| payments.currency.clone())
            .to_lowercase();
        Self {
            currency,
            frontend_url: payments.frontend_url.trim_end_matches('/').to_string(),
            config,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<Value, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", intent_id)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        read_json(NAME, response).await
    }

    /// Maps a verified event to an outcome; unrelated event types yield `None`.
    async fn outcome_for(&self, event: WebhookEvent) -> Result<Option<PaymentOutcome>, ServiceError> {
        let object = &event.data.object;
        let (order_id, transaction_id, status) = match event.kind.as_str() {
            "checkout.session.completed" => {
                let status = if object.get("payment_status").and_then(Value::as_str) == Some("paid") {
                    OutcomeStatus::Success
                } else {
                    OutcomeStatus::Failed
                };
                (
                    metadata_order_id(object),
                    str_field(object, "payment_intent"),
                    status,
                )
            }
            "payment_intent.succeeded" => (
                metadata_order_id(object),
                str_field(object, "id"),
                OutcomeStatus::Success,
            ),
            "payment_intent.payment_failed" => (
                metadata_order_id(object),
                str_field(object, "id"),
                OutcomeStatus::Failed,
            ),
            "charge.succeeded" => {
                let Some(intent_id) = str_field(object, "payment_intent") else {
                    warn!("charge event without payment_intent");
                    return Ok(None);
                };
                let intent = self.retrieve_intent(&intent_id).await?;
                (
                    metadata_order_id(&intent),
                    Some(intent_id),
                    OutcomeStatus::Success,
                )
            }
            other => {
                info!(event_type = other, "ignoring stripe event");
                return Ok(None);
            }
        };

        if order_id.is_none() {
            error!(event_type = %event.kind, "stripe event missing order_id metadata");
            return Ok(None);
        }
        Ok(PaymentOutcome::new(order_id, transaction_id, status))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Stripe
    }

    fn provider_name(&self) -> Option<&'static str> {
        Some(NAME)
    }

    #[instrument(skip(self, request), fields(order_id = %request.order.id))]
    async fn initiate(&self, request: &PaymentRequest<'_>) -> Result<GatewayHandle, ServiceError> {
        let order_id = request.order.id.to_string();
        let user_id = request.order.user_id.to_string();
        let unit_amount = to_minor_units(request.amount)?.to_string();
        let product_name = format!("Order #{}", order_id);
        let success_url = format!(
            "{}/payment/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.frontend_url
        );
        let cancel_url = format!("{}/payment/cancel", self.frontend_url);

        let form: [(&str, &str); 12] = [
            ("mode", "payment"),
            ("payment_method_types[0]", "card"),
            ("line_items[0][price_data][currency]", &self.currency),
            ("line_items[0][price_data][product_data][name]", &product_name),
            ("line_items[0][price_data][unit_amount]", &unit_amount),
            ("line_items[0][quantity]", "1"),
            ("metadata[order_id]", &order_id),
            ("metadata[user_id]", &user_id),
            ("payment_intent_data[metadata][order_id]", &order_id),
            ("payment_intent_data[metadata][user_id]", &user_id),
            ("success_url", &success_url),
            ("cancel_url", &cancel_url),
        ];

        let response = self
            .client
            .post(self.url("/v1/checkout/sessions"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", format!("checkout-{}", order_id))
            .form(&form)
            .send()
            .await?;
        let session: CheckoutSession = serde_json::from_value(read_json(NAME, response).await?)?;

        info!(session_id = %session.id, "stripe checkout session created");
        Ok(GatewayHandle {
            redirect_url: session.url,
            external_order_id: Some(order_id),
            transaction_id: Some(session.id),
            ..GatewayHandle::pending()
        })
    }

    #[instrument(skip_all)]
    async fn reconcile(
        &self,
        callback: &GatewayCallback,
    ) -> Result<Option<PaymentOutcome>, ServiceError> {
        let GatewayCallback::Body { headers, body } = callback else {
            return Ok(None);
        };

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::InvalidSignature("missing Stripe-Signature".into()))?;
        verify_signature(
            signature,
            body,
            &self.config.webhook_secret,
            self.config.webhook_tolerance_secs,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(error = %e, "stripe webhook rejected");
            e
        })?;

        let event: WebhookEvent = serde_json::from_slice(body)?;
        info!(event_type = %event.kind, "received stripe event");
        self.outcome_for(event).await
    }
}
