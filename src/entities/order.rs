use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Order lifecycle. Transitions only move forward; cancellation is allowed
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Paid => 1,
            Self::Shipped => 2,
            Self::Delivered => 3,
            Self::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// Immutable purchase snapshot taken from a cart at checkout
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub shipping_address_id: Uuid,
    pub status: OrderStatus,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_tax: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub grand_total: Decimal,
    /// Code as entered at checkout; not a live reference to the coupon row
    #[sea_orm(nullable)]
    pub coupon_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_one = "super::payment::Entity")]
    Payment,
    #[sea_orm(has_one = "super::invoice::Entity")]
    Invoice,
    #[sea_orm(
        belongs_to = "super::shipping_address::Entity",
        from = "Column::ShippingAddressId",
        to = "super::shipping_address::Column::Id",
        on_delete = "Restrict"
    )]
    ShippingAddress,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
    }
}

impl Related<super::invoice::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Invoice.def()
    }
}

impl Related<super::shipping_address::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ShippingAddress.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
