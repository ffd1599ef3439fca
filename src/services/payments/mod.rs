//! Payment gateway contract and the registry that resolves a method name to
//! its configured implementation.

pub mod cod;
pub mod paymob;
pub mod paypal;
pub mod stripe;

use crate::cache::CacheBackend;
use crate::config::PaymentsConfig;
use crate::entities::{order, shipping_address};
use crate::errors::ServiceError;
use crate::services::pricing::round_money;
use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use crate::entities::payment::{PaymentMethod, PaymentStatus};
pub use cod::CodGateway;
pub use paymob::PaymobGateway;
pub use paypal::PaypalGateway;
pub use stripe::StripeGateway;

const MAX_ERROR_BODY: usize = 512;

/// What a gateway reports back from `initiate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayHandle {
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl GatewayHandle {
    pub fn pending() -> Self {
        Self {
            status: PaymentStatus::Pending,
            redirect_url: None,
            external_order_id: None,
            transaction_id: None,
        }
    }

    /// Synchronous methods settle during checkout.
    pub fn is_settled(&self) -> bool {
        self.status == PaymentStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl From<OutcomeStatus> for PaymentStatus {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Success => PaymentStatus::Success,
            OutcomeStatus::Failed => PaymentStatus::Failed,
        }
    }
}

/// Decoded gateway result; at least one id is present
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOutcome {
    pub external_order_id: Option<String>,
    pub transaction_id: Option<String>,
    pub status: OutcomeStatus,
}

impl PaymentOutcome {
    /// `None` when neither id is known, which callers treat as an unhandled callback.
    pub fn new(
        external_order_id: Option<String>,
        transaction_id: Option<String>,
        status: OutcomeStatus,
    ) -> Option<Self> {
        let external_order_id = external_order_id.filter(|s| !s.is_empty());
        let transaction_id = transaction_id.filter(|s| !s.is_empty());
        if external_order_id.is_none() && transaction_id.is_none() {
            return None;
        }
        Some(Self {
            external_order_id,
            transaction_id,
            status,
        })
    }
}

/// Raw callback as received over HTTP
#[derive(Debug, Clone)]
pub enum GatewayCallback {
    /// POST notification; the raw bytes are kept for signature checks
    Body { headers: HeaderMap, body: Bytes },
    /// Shopper redirect back to the storefront
    Query(HashMap<String, String>),
}

impl GatewayCallback {
    /// Parses a JSON body; `None` for query callbacks or non-JSON bodies.
    pub fn json(&self) -> Option<Value> {
        match self {
            GatewayCallback::Body { body, .. } => serde_json::from_slice(body).ok(),
            GatewayCallback::Query(_) => None,
        }
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        match self {
            GatewayCallback::Query(params) => params.get(key).map(String::as_str).filter(|v| !v.is_empty()),
            GatewayCallback::Body { .. } => None,
        }
    }
}

/// Everything a gateway needs to open a payment for an order
#[derive(Debug, Clone, Copy)]
pub struct PaymentRequest<'a> {
    pub order: &'a order::Model,
    pub amount: Decimal,
    pub shipping: &'a shipping_address::Model,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Display name stored on the payment row
    fn provider_name(&self) -> Option<&'static str>;

    async fn initiate(&self, request: &PaymentRequest<'_>) -> Result<GatewayHandle, ServiceError>;

    /// `Ok(None)` means the callback carries nothing this gateway acts on.
    async fn reconcile(
        &self,
        callback: &GatewayCallback,
    ) -> Result<Option<PaymentOutcome>, ServiceError>;
}

/// Maps every [`PaymentMethod`] to its gateway. Gateways without credentials are absent.
#[derive(Clone)]
pub struct GatewayRegistry {
    cod: Arc<CodGateway>,
    paypal: Option<Arc<PaypalGateway>>,
    paymob: Option<Arc<PaymobGateway>>,
    stripe: Option<Arc<StripeGateway>>,
}

impl GatewayRegistry {
    pub fn from_config(
        config: &PaymentsConfig,
        cache: Arc<dyn CacheBackend>,
    ) -> Result<Self, ServiceError> {
        let client = build_http_client(config.request_timeout())?;

        let paypal = config.paypal.as_ref().map(|cfg| {
            Arc::new(PaypalGateway::new(
                cfg.clone(),
                config,
                client.clone(),
                cache.clone(),
            ))
        });
        let paymob = config.paymob.as_ref().map(|cfg| {
            Arc::new(PaymobGateway::new(
                cfg.clone(),
                config,
                client.clone(),
                cache.clone(),
            ))
        });
        let stripe = config
            .stripe
            .as_ref()
            .map(|cfg| Arc::new(StripeGateway::new(cfg.clone(), config, client.clone())));

        Ok(Self {
            cod: Arc::new(CodGateway),
            paypal,
            paymob,
            stripe,
        })
    }

    pub fn get(&self, method: PaymentMethod) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        let gateway: Option<Arc<dyn PaymentGateway>> = match method {
            PaymentMethod::Cod => Some(self.cod.clone()),
            PaymentMethod::Paypal => self.paypal.clone().map(|g| g as Arc<dyn PaymentGateway>),
            PaymentMethod::Paymob => self.paymob.clone().map(|g| g as Arc<dyn PaymentGateway>),
            PaymentMethod::Stripe => self.stripe.clone().map(|g| g as Arc<dyn PaymentGateway>),
        };
        gateway.ok_or_else(|| ServiceError::UnsupportedGateway(format!("{} is not configured", method)))
    }

    /// Resolves a lowercase method name such as `paypal`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        let method = parse_method(name)?;
        self.get(method)
    }

    pub fn available(&self) -> Vec<PaymentMethod> {
        use sea_orm::Iterable;
        PaymentMethod::iter()
            .filter(|m| self.get(*m).is_ok())
            .collect()
    }
}

pub fn parse_method(name: &str) -> Result<PaymentMethod, ServiceError> {
    PaymentMethod::from_str(name.trim())
        .map_err(|_| ServiceError::UnsupportedGateway(name.to_string()))
}

pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))
}

/// Amount as a fixed two-decimal string, e.g. `"220.00"`.
pub fn format_amount(amount: Decimal) -> String {
    let mut rounded = round_money(amount);
    rounded.rescale(2);
    rounded.to_string()
}

/// Amount in minor units (cents).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} out of range", amount)))
}

/// Reads a gateway response, turning non-2xx statuses into `ExternalServiceError`.
pub async fn read_json(gateway: &str, response: reqwest::Response) -> Result<Value, ServiceError> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        warn!(gateway, status = status.as_u16(), "gateway returned an error");
        return Err(gateway_error(gateway, status, &text));
    }
    serde_json::from_str(&text).map_err(|e| {
        ServiceError::ExternalServiceError(format!("{} returned invalid JSON: {}", gateway, e))
    })
}

pub fn gateway_error(gateway: &str, status: reqwest::StatusCode, body: &str) -> ServiceError {
    let truncated: String = body.chars().take(MAX_ERROR_BODY).collect();
    ServiceError::ExternalServiceError(format!("{} responded {}: {}", gateway, status, truncated))
}

/// String form of a JSON scalar; gateways mix numeric and string ids.
pub fn json_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Access token shared by concurrent requests. Refreshes are serialized so a
/// burst of checkouts triggers one token call.
pub struct AccessTokenCache {
    key: String,
    cache: Arc<dyn CacheBackend>,
    refresh_margin: Duration,
    refresh_lock: Mutex<()>,
}

impl AccessTokenCache {
    pub fn new(key: impl Into<String>, cache: Arc<dyn CacheBackend>, refresh_margin: Duration) -> Self {
        Self {
            key: key.into(),
            cache,
            refresh_margin,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns the cached token or calls `fetch`, which yields the token and its lifetime.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), ServiceError>>,
    {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let (token, lifetime) = fetch().await?;
        let ttl = lifetime.saturating_sub(self.refresh_margin);
        if ttl.is_zero() {
            debug!(key = %self.key, "token lifetime shorter than refresh margin; not caching");
        } else if let Err(e) = self.cache.set(&self.key, &token, Some(ttl)).await {
            warn!(key = %self.key, error = %e, "failed to cache access token");
        }
        Ok(token)
    }

    pub async fn invalidate(&self) {
        if let Err(e) = self.cache.delete(&self.key).await {
            warn!(key = %self.key, error = %e, "failed to drop cached token");
        }
    }

    /// Sends a request with the current token. On 401 the cached token is
    /// dropped and the request is sent once more with a fresh one.
    pub async fn send_authorized<T, TF, S, SF>(
        &self,
        token: T,
        send: S,
    ) -> Result<reqwest::Response, ServiceError>
    where
        T: Fn() -> TF,
        TF: Future<Output = Result<String, ServiceError>>,
        S: Fn(String) -> SF,
        SF: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let response = send(token().await?).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(key = %self.key, "access token rejected; refreshing");
        self.invalidate().await;
        Ok(send(token().await?).await?)
    }

    async fn cached(&self) -> Option<String> {
        match self.cache.get(&self.key).await {
            Ok(token) => token,
            Err(e) => {
                warn!(key = %self.key, error = %e, "token cache read failed");
                None
            }
        }
    }
}
