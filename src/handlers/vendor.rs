use axum::extract::{Path, State};
use uuid::Uuid;

use crate::auth::VendorUser;
use crate::handlers::common::success_response;
use crate::services::orders::VendorOrder;
use crate::{ApiResult, AppState};

/// Orders that contain the vendor's products, with the vendor's share
pub async fn list_vendor_orders(
    State(state): State<AppState>,
    vendor: VendorUser,
) -> ApiResult<Vec<VendorOrder>> {
    let orders = state.services.orders.vendor_orders(vendor.vendor_id).await?;
    Ok(success_response(orders))
}

pub async fn get_vendor_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    vendor: VendorUser,
) -> ApiResult<VendorOrder> {
    let order = state.services.orders.vendor_order(vendor.vendor_id, id).await?;
    Ok(success_response(order))
}
