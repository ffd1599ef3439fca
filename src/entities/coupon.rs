use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    #[sea_orm(string_value = "percent")]
    Percent,
    #[sea_orm(string_value = "fixed")]
    Fixed,
}

/// Discount code. Checkout reads it and never writes it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub discount_type: DiscountType,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub value: Decimal,
    #[sea_orm(nullable)]
    pub valid_from: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub valid_to: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub min_order_amount: Decimal,
    pub first_order_only: bool,
    pub is_public: bool,
    pub is_active: bool,
    /// Stored for the admin surface; redemption counts are not tracked.
    #[sea_orm(nullable)]
    pub max_uses: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Percent coupons must stay within 0..=100; fixed coupons must be non-negative.
    pub fn validate_value(&self) -> Result<(), String> {
        match self.discount_type {
            DiscountType::Percent if self.value < Decimal::ZERO || self.value > Decimal::ONE_HUNDRED => {
                Err(format!(
                    "percent coupon value must be between 0 and 100, got {}",
                    self.value
                ))
            }
            DiscountType::Fixed if self.value < Decimal::ZERO => Err(format!(
                "fixed coupon value must not be negative, got {}",
                self.value
            )),
            _ => Ok(()),
        }
    }

    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| now >= from)
            && self.valid_to.map_or(true, |to| now <= to)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
