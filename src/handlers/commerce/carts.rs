use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::auth::{AuthUser, MaybeAuthUser};
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::services::commerce::{CartOwner, CartView, MergeSummary};
use crate::{ApiResponse, AppState};

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub variant_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub merged: MergeSummary,
    pub cart: CartView,
}

/// Reads the guest token from the `Cookie` header. Malformed values are ignored.
pub fn guest_token(headers: &HeaderMap, cookie_name: &str) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
}

fn cookie_attributes(config: &AppConfig, max_age: i64) -> String {
    let secure = if config.cookie_secure { "; Secure" } else { "" };
    format!("HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}", max_age, secure)
}

pub fn guest_cookie(config: &AppConfig, token: Uuid) -> Result<HeaderValue, ServiceError> {
    let value = format!(
        "{}={}; {}",
        config.guest_cart_cookie,
        token,
        cookie_attributes(config, config.guest_cart_max_age().num_seconds())
    );
    HeaderValue::from_str(&value)
        .map_err(|e| ServiceError::InternalError(format!("invalid cookie header: {}", e)))
}

pub fn clear_guest_cookie(config: &AppConfig) -> Result<HeaderValue, ServiceError> {
    let value = format!("{}=; {}", config.guest_cart_cookie, cookie_attributes(config, 0));
    HeaderValue::from_str(&value)
        .map_err(|e| ServiceError::InternalError(format!("invalid cookie header: {}", e)))
}

fn owner(state: &AppState, user: MaybeAuthUser, headers: &HeaderMap) -> CartOwner {
    match user.0 {
        Some(user) => CartOwner::User(user.user_id),
        None => CartOwner::Guest(guest_token(headers, &state.config.guest_cart_cookie)),
    }
}

/// Wraps the cart in the envelope and sets the guest cookie when a new token was issued.
fn cart_response(state: &AppState, view: CartView) -> Result<Response, ServiceError> {
    let issued = view.issued_guest_token;
    let mut response = Json(ApiResponse::success(view)).into_response();
    if let Some(token) = issued {
        debug!("issuing guest cart cookie");
        response
            .headers_mut()
            .append(header::SET_COOKIE, guest_cookie(&state.config, token)?);
    }
    Ok(response)
}

pub async fn get_cart(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let view = state
        .services
        .cart
        .get_or_create(owner(&state, user, &headers))
        .await?;
    cart_response(&state, view)
}

pub async fn add_item(
    State(state): State<AppState>,
    user: MaybeAuthUser,
    headers: HeaderMap,
    Json(request): Json<AddItemRequest>,
) -> Result<Response, ServiceError> {
    let view = state
        .services
        .cart
        .add_item(owner(&state, user, &headers), request.variant_id)
        .await?;
    cart_response(&state, view)
}

pub async fn increment_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    user: MaybeAuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let view = state
        .services
        .cart
        .increment(owner(&state, user, &headers), item_id)
        .await?;
    cart_response(&state, view)
}

pub async fn decrement_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    user: MaybeAuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let view = state
        .services
        .cart
        .decrement(owner(&state, user, &headers), item_id)
        .await?;
    cart_response(&state, view)
}

pub async fn remove_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    user: MaybeAuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let view = state
        .services
        .cart
        .remove(owner(&state, user, &headers), item_id)
        .await?;
    cart_response(&state, view)
}

/// Called right after login. Merge failures never fail the request.
pub async fn merge_cart(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let cart = &state.services.cart;
    let merged = match guest_token(&headers, &state.config.guest_cart_cookie) {
        Some(token) => cart.merge_guest_cart_best_effort(user.user_id, token).await,
        None => MergeSummary::default(),
    };
    let view = cart.get_or_create(CartOwner::User(user.user_id)).await?;

    let mut response = Json(ApiResponse::success(MergeResponse { merged, cart: view })).into_response();
    response
        .headers_mut()
        .append(header::SET_COOKIE, clear_guest_cookie(&state.config)?);
    Ok(response)
}
