//! Gateway callbacks. These routes are unauthenticated; each gateway proves
//! authenticity its own way (signature, or re-reading state from the gateway).

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::info;

use crate::errors::ServiceError;
use crate::services::payments::GatewayCallback;
use crate::services::reconciliation::ReconcileResult;
use crate::AppState;

/// Server-to-server notification (webhook)
pub async fn callback_post(
    State(state): State<AppState>,
    Path(gateway_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReconcileResult>, ServiceError> {
    info!(gateway = %gateway_type, bytes = body.len(), "payment callback received");
    let result = state
        .services
        .reconciler
        .reconcile(&gateway_type, GatewayCallback::Body { headers, body })
        .await?;
    Ok(Json(result))
}

/// Shopper redirected back from the gateway
pub async fn callback_get(
    State(state): State<AppState>,
    Path(gateway_type): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ReconcileResult>, ServiceError> {
    info!(gateway = %gateway_type, "payment return received");
    let result = state
        .services
        .reconciler
        .reconcile(&gateway_type, GatewayCallback::Query(params))
        .await?;
    Ok(Json(result))
}
