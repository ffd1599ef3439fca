use crate::entities::{order, shipping_address};
use crate::errors::ServiceError;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateAddressInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(length(min = 5, max = 30))]
    pub phone_number: String,
    #[validate(length(min = 1, max = 255))]
    pub address_line_1: String,
    #[validate(length(max = 255))]
    pub address_line_2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(max = 100))]
    pub state: Option<String>,
    #[validate(length(max = 20))]
    pub postal_code: Option<String>,
    #[validate(length(min = 2, max = 100))]
    pub country: String,
    #[validate(length(max = 1000))]
    pub instructions: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Shipping address book. Each user has at most one default address.
#[derive(Clone)]
pub struct AddressService {
    db: Arc<DatabaseConnection>,
}

impl AddressService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Default first, then newest first.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<shipping_address::Model>, ServiceError> {
        Ok(shipping_address::Entity::find()
            .filter(shipping_address::Column::UserId.eq(user_id))
            .order_by_desc(shipping_address::Column::IsDefault)
            .order_by_desc(shipping_address::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// The first address a user saves becomes the default.
    #[instrument(skip(self, input))]
    pub async fn create(
        &self,
        user_id: Uuid,
        input: CreateAddressInput,
    ) -> Result<shipping_address::Model, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await?;

        let existing = shipping_address::Entity::find()
            .filter(shipping_address::Column::UserId.eq(user_id))
            .count(&txn)
            .await?;
        let is_default = input.is_default || existing == 0;

        if is_default {
            shipping_address::Entity::update_many()
                .col_expr(shipping_address::Column::IsDefault, Expr::value(false))
                .filter(shipping_address::Column::UserId.eq(user_id))
                .filter(shipping_address::Column::IsDefault.eq(true))
                .exec(&txn)
                .await?;
        }

        let address = shipping_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            full_name: Set(input.full_name.trim().to_string()),
            phone_number: Set(input.phone_number.trim().to_string()),
            address_line_1: Set(input.address_line_1),
            address_line_2: Set(input.address_line_2.filter(|s| !s.trim().is_empty())),
            city: Set(input.city),
            state: Set(input.state),
            postal_code: Set(input.postal_code),
            country: Set(input.country),
            instructions: Set(input.instructions),
            is_default: Set(is_default),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        info!(address_id = %address.id, is_default, "shipping address created");
        Ok(address)
    }

    /// Addresses referenced by an order cannot be deleted. Removing the default
    /// promotes the newest remaining address.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: Uuid, address_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let address = shipping_address::Entity::find_by_id(address_id)
            .filter(shipping_address::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("shipping address".to_string()))?;

        let referenced = order::Entity::find()
            .filter(order::Column::ShippingAddressId.eq(address_id))
            .count(&txn)
            .await?;
        if referenced > 0 {
            return Err(ServiceError::Conflict(
                "shipping address is used by an existing order".to_string(),
            ));
        }

        shipping_address::Entity::delete_by_id(address.id)
            .exec(&txn)
            .await?;

        if address.is_default {
            if let Some(next) = shipping_address::Entity::find()
                .filter(shipping_address::Column::UserId.eq(user_id))
                .order_by_desc(shipping_address::Column::CreatedAt)
                .one(&txn)
                .await?
            {
                let mut next: shipping_address::ActiveModel = next.into();
                next.is_default = Set(true);
                next.update(&txn).await?;
            }
        }

        txn.commit().await?;
        info!(%address_id, "shipping address deleted");
        Ok(())
    }
}
