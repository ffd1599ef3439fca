use super::round_money;
use crate::entities::tax::{self, TaxType};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder};

/// Sums every active rule over `taxable`. Percentage rules are rounded to cents
/// individually; fixed rules add their flat value.
pub fn compute_tax(taxable: Decimal, taxes: &[tax::Model]) -> Decimal {
    let taxable = taxable.max(Decimal::ZERO);
    taxes
        .iter()
        .filter(|t| t.is_active)
        .map(|t| match t.tax_type {
            TaxType::Percentage => round_money(taxable * t.value / Decimal::ONE_HUNDRED),
            TaxType::Fixed => round_money(t.value),
        })
        .sum()
}

pub async fn active_taxes<C: ConnectionTrait>(conn: &C) -> Result<Vec<tax::Model>, DbErr> {
    tax::Entity::find()
        .filter(tax::Column::IsActive.eq(true))
        .order_by_asc(tax::Column::Name)
        .all(conn)
        .await
}
