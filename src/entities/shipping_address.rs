use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shipping_addresses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub full_name: String,
    pub phone_number: String,
    pub address_line_1: String,
    #[sea_orm(nullable)]
    pub address_line_2: Option<String>,
    pub city: String,
    #[sea_orm(nullable)]
    pub state: Option<String>,
    #[sea_orm(nullable)]
    pub postal_code: Option<String>,
    pub country: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub instructions: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Single-line form printed on invoices
    pub fn billing_line(&self) -> String {
        format!("{}, {}, {}", self.full_name, self.address_line_1, self.city)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
