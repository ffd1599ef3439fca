use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::entities::shipping_address;
use crate::handlers::common::{created_response, no_content_response, success_response};
use crate::services::addresses::CreateAddressInput;
use crate::{auth::AuthUser, errors::ServiceError, ApiResponse, ApiResult, AppState};

pub async fn list_addresses(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Vec<shipping_address::Model>> {
    let addresses = state.services.addresses.list(user.user_id).await?;
    Ok(success_response(addresses))
}

pub async fn create_address(
    State(state): State<AppState>,
    user: AuthUser,
    Json(input): Json<CreateAddressInput>,
) -> Result<(StatusCode, Json<ApiResponse<shipping_address::Model>>), ServiceError> {
    let address = state.services.addresses.create(user.user_id, input).await?;
    Ok(created_response(address))
}

pub async fn delete_address(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> Result<StatusCode, ServiceError> {
    state.services.addresses.delete(user.user_id, id).await?;
    Ok(no_content_response())
}
