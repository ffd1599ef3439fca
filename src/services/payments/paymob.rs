//! Paymob invoice API. Checkout creates a hosted invoice; results come back as a
//! transaction webhook (`obj` envelope) or as query parameters on the redirect.
//! Neither is trusted: the transaction is read back from Paymob and only that
//! record decides the outcome.

use super::{
    json_id, read_json, to_minor_units, AccessTokenCache, GatewayCallback, GatewayHandle,
    OutcomeStatus, PaymentGateway, PaymentMethod, PaymentOutcome, PaymentRequest,
};
use crate::cache::CacheBackend;
use crate::config::{PaymentsConfig, PaymobConfig};
use crate::entities::shipping_address;
use crate::errors::ServiceError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use reqwest::StatusCode;
use tracing::{info, instrument, warn};

const NAME: &str = "Paymob";
const UNSPECIFIED: &str = "NA";

pub struct PaymobGateway {
    config: PaymobConfig,
    currency: String,
    client: reqwest::Client,
    token: AccessTokenCache,
}

impl PaymobGateway {
    pub fn new(
        config: PaymobConfig,
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
                "paymob:auth_token",
                cache,
                payments.token_refresh_margin(),
            ),
            currency,
            config,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn auth_token(&self) -> Result<String, ServiceError> {
        let lifetime = Duration::from_secs(self.config.token_ttl_secs);
        self.token
            .get_or_refresh(|| async {
                let response = self
                    .client
                    .post(self.url("/api/auth/tokens"))
                    .json(&json!({ "api_key": self.config.api_key }))
                    .send()
                    .await?;
                let body = read_json(NAME, response).await?;
                let token = body
                    .get("token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ServiceError::ExternalServiceError("Paymob auth response has no token".into())
                    })?
                    .to_string();
                Ok((token, lifetime))
            })
            .await
    }

    /// Paymob's own record of a transaction. An unknown id is `PaymentNotFound`.
    async fn fetch_transaction(&self, transaction_id: &str) -> Result<Value, ServiceError> {
        let url = self.url(&format!("/api/acceptance/transactions/{}", transaction_id));
        let response = self
            .token
            .send_authorized(
                || self.auth_token(),
                |token| self.client.get(url.as_str()).bearer_auth(token).send(),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!(transaction_id, "paymob has no such transaction");
            return Err(ServiceError::PaymentNotFound(transaction_id.to_string()));
        }
        read_json(NAME, response).await
    }
}

fn shipping_data(address: &shipping_address::Model) -> Value {
    let mut names = address.full_name.split_whitespace();
    let first_name = names.next().unwrap_or(UNSPECIFIED).to_string();
    let rest: Vec<&str> = names.collect();
    let last_name = if rest.is_empty() {
        UNSPECIFIED.to_string()
    } else {
        rest.join(" ")
    };

    json!({
        "first_name": first_name,
        "last_name": last_name,
        "phone_number": address.phone_number,
        "email": UNSPECIFIED,
        "street": address.address_line_1,
        "building": UNSPECIFIED,
        "floor": UNSPECIFIED,
        "apartment": UNSPECIFIED,
        "city": address.city,
        "state": address.state.as_deref().unwrap_or(UNSPECIFIED),
        "postal_code": address.postal_code.as_deref().unwrap_or(UNSPECIFIED),
        "country": address.country,
    })
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Transaction webhook payload, with or without the `obj` envelope.
fn outcome_from_body(body: &Value) -> Option<PaymentOutcome> {
    let txn = body.get("obj").unwrap_or(body);
    let order_id = txn.get("order").and_then(|order| match order {
        Value::Object(_) => order.get("id").and_then(json_id),
        other => json_id(other),
    });
    let transaction_id = txn.get("id").and_then(json_id);
    let status = if truthy(txn.get("success")) {
        OutcomeStatus::Success
    } else {
        OutcomeStatus::Failed
    };
    PaymentOutcome::new(order_id, transaction_id, status)
}

fn outcome_from_query(callback: &GatewayCallback) -> Option<PaymentOutcome> {
    let status = if callback.query("success") == Some("true") {
        OutcomeStatus::Success
    } else {
        OutcomeStatus::Failed
    };
    PaymentOutcome::new(
        callback.query("order").map(str::to_string),
        callback.query("id").map(str::to_string),
        status,
    )
}

#[async_trait]
impl PaymentGateway for PaymobGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Paymob
    }

    fn provider_name(&self) -> Option<&'static str> {
        Some(NAME)
    }

    #[instrument(skip(self, request), fields(order_id = %request.order.id))]
    async fn initiate(&self, request: &PaymentRequest<'_>) -> Result<GatewayHandle, ServiceError> {
        let body = json!({
            "api_source": "INVOICE",
            "amount_cents": to_minor_units(request.amount)?.to_string(),
            "currency": self.currency,
            "merchant_order_id": request.order.id.to_string(),
            "shipping_data": shipping_data(request.shipping),
            "integrations": self.config.integrations,
        });

        let url = self.url("/api/ecommerce/orders");
        let response = self
            .token
            .send_authorized(
                || self.auth_token(),
                |token| {
                    let mut body = body.clone();
                    body["auth_token"] = Value::String(token);
                    self.client.post(url.as_str()).json(&body).send()
                },
            )
            .await?;
        let created = read_json(NAME, response).await?;

        let paymob_order_id = created.get("id").and_then(json_id).ok_or_else(|| {
            ServiceError::ExternalServiceError("Paymob order response has no id".into())
        })?;
        let payment_url = created
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string);

        info!(paymob_order_id = %paymob_order_id, "paymob invoice created");
        Ok(GatewayHandle {
            redirect_url: payment_url,
            external_order_id: Some(paymob_order_id),
            ..GatewayHandle::pending()
        })
    }

    #[instrument(skip_all)]
    async fn reconcile(
        &self,
        callback: &GatewayCallback,
    ) -> Result<Option<PaymentOutcome>, ServiceError> {
        let claimed = match callback {
            GatewayCallback::Body { .. } => callback.json().as_ref().and_then(outcome_from_body),
            GatewayCallback::Query(_) => outcome_from_query(callback),
        };
        let Some(transaction_id) = claimed.and_then(|c| c.transaction_id) else {
            return Ok(None);
        };

        let transaction = self.fetch_transaction(&transaction_id).await?;
        let verified = outcome_from_body(&transaction);
        if verified.as_ref().and_then(|v| v.transaction_id.as_deref()) != Some(transaction_id.as_str()) {
            warn!(transaction_id = %transaction_id, "paymob returned a different transaction");
            return Err(ServiceError::ExternalServiceError(
                "Paymob transaction lookup returned a mismatched record".into(),
            ));
        }
        Ok(verified)
    }
}
