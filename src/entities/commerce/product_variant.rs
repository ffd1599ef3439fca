use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Sellable variant of a product, carrying price and stock
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(unique)]
    pub sku: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub discounted_price: Option<Decimal>,
    pub stock: i32,
    pub is_default: bool,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Price charged right now: the discounted price when one is set.
    pub fn effective_price(&self) -> Decimal {
        self.discounted_price.unwrap_or(self.price)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
    #[sea_orm(has_many = "super::cart_item::Entity")]
    CartItems,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Related<super::cart_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn variant(price: Decimal, discounted: Option<Decimal>) -> Model {
        Model {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            sku: "SKU-1".into(),
            price,
            discounted_price: discounted,
            stock: 1,
            is_default: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn effective_price_prefers_discount() {
        assert_eq!(variant(dec!(100), Some(dec!(80))).effective_price(), dec!(80));
        assert_eq!(variant(dec!(100), None).effective_price(), dec!(100));
    }
}
