use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::entities::{invoice, order, order_item, payment};
use crate::handlers::common::{created_response, success_response};
use crate::services::commerce::{CreateOrderInput, PlacedOrder};
use crate::services::orders::{ListQuery, OrderDetail, OrderListResponse};
use crate::{auth::AuthUser, errors::ServiceError, ApiResponse, ApiResult, AppState};

/// Where the shopper has to go to finish paying
#[derive(Debug, Serialize)]
pub struct PaymentAction {
    pub redirect_url: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment: payment::Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<invoice::Model>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_action: Option<PaymentAction>,
}

impl From<PlacedOrder> for CreateOrderResponse {
    fn from(placed: PlacedOrder) -> Self {
        Self {
            payment_action: placed
                .handle
                .redirect_url
                .map(|redirect_url| PaymentAction { redirect_url }),
            order: placed.order,
            items: placed.items,
            payment: placed.payment,
            invoice: placed.invoice,
        }
    }
}

/// Place an order from the caller's cart
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<CreateOrderInput>,
) -> Result<(StatusCode, Json<ApiResponse<CreateOrderResponse>>), ServiceError> {
    let placed = state
        .services
        .checkout
        .create_order(user.user_id, input)
        .await?;
    Ok(created_response(CreateOrderResponse::from(placed)))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    user: AuthUser,
) -> ApiResult<OrderListResponse> {
    let orders = state.services.orders.my_orders(user.user_id, query).await?;
    Ok(success_response(orders))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> ApiResult<OrderDetail> {
    let detail = state.services.orders.order_detail(user.user_id, id).await?;
    Ok(success_response(detail))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<invoice::Model>> {
    let invoices = state.services.orders.my_invoices(user.user_id).await?;
    Ok(success_response(invoices))
}
