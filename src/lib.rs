//! Marketplace checkout library
//!
//! Carts, order creation, multi-gateway payments and callback reconciliation
//! for a multi-vendor marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod notifications;
pub mod services;
pub mod tracing;

use axum::{
    extract::{FromRef, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::JwtVerifier;
use crate::cache::{CacheBackend, InMemoryCache};
use crate::services::payments::GatewayRegistry;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub jwt: Arc<JwtVerifier>,
    pub registry: Arc<GatewayRegistry>,
    pub services: handlers::AppServices,
}

impl AppState {
    /// Wires gateways and services from configuration. Gateway tokens and
    /// idempotency keys live in an in-process cache.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: events::EventSender,
    ) -> Result<Self, errors::ServiceError> {
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
        let registry = Arc::new(GatewayRegistry::from_config(&config.payments, cache)?);
        let event_sender = Arc::new(event_sender);
        let services =
            handlers::AppServices::new(db.clone(), &config, registry.clone(), event_sender.clone());

        Ok(Self {
            jwt: Arc::new(JwtVerifier::new(&config.jwt_secret)),
            config: Arc::new(config),
            db,
            event_sender,
            registry,
            services,
        })
    }
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

// Common response wrappers
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let orders = Router::new()
        .route(
            "/orders",
            get(handlers::orders::list_orders).post(handlers::orders::create_order),
        )
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/invoices", get(handlers::orders::list_invoices));

    let payments = Router::new().route(
        "/payments/callback/:gateway_type",
        post(handlers::payment_callbacks::callback_post)
            .get(handlers::payment_callbacks::callback_get),
    );

    let cart = Router::new()
        .route("/cart", get(handlers::commerce::carts::get_cart))
        .route("/cart/items", post(handlers::commerce::carts::add_item))
        .route(
            "/cart/items/:id",
            delete(handlers::commerce::carts::remove_item),
        )
        .route(
            "/cart/items/:id/increment",
            post(handlers::commerce::carts::increment_item),
        )
        .route(
            "/cart/items/:id/decrement",
            post(handlers::commerce::carts::decrement_item),
        )
        .route("/cart/merge", post(handlers::commerce::carts::merge_cart));

    let addresses = Router::new()
        .route(
            "/shipping-addresses",
            get(handlers::addresses::list_addresses).post(handlers::addresses::create_address),
        )
        .route(
            "/shipping-addresses/:id",
            delete(handlers::addresses::delete_address),
        );

    let vendor = Router::new()
        .route("/vendor/orders", get(handlers::vendor::list_vendor_orders))
        .route("/vendor/orders/:id", get(handlers::vendor::get_vendor_order));

    Router::new()
        .route("/health", get(health_check))
        .merge(orders)
        .merge(payments)
        .merge(cart)
        .merge(addresses)
        .merge(vendor)
}

/// Full application router with request ids and HTTP tracing
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match db::check_connection(&state.db).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Ok(Json(ApiResponse::success(json!({
        "status": db_status,
        "version": env!("CARGO_PKG_VERSION"),
        "checks": { "database": db_status },
        "gateways": state.registry.available(),
        "timestamp": Utc::now().to_rfc3339(),
    }))))
}
