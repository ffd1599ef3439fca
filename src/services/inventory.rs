use crate::entities::commerce::product_variant;
use crate::errors::ServiceError;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect,
};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Locks a variant row for the rest of the transaction.
pub async fn lock_variant<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
) -> Result<product_variant::Model, ServiceError> {
    product_variant::Entity::find_by_id(variant_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("variant {}", variant_id)))
}

/// Decrements stock for every `(variant_id, quantity)` pair.
///
/// Quantities for the same variant are summed first and variants are locked in
/// id order, so concurrent commits always acquire locks in the same sequence.
/// The decrement itself is guarded by `stock >= quantity`, which keeps stock
/// non-negative even where row locks are unavailable.
#[instrument(skip(conn, lines), fields(lines = lines.len()))]
pub async fn commit_stock<C: ConnectionTrait>(
    conn: &C,
    lines: &[(Uuid, i32)],
) -> Result<(), ServiceError> {
    let mut wanted: BTreeMap<Uuid, i32> = BTreeMap::new();
    for (variant_id, quantity) in lines {
        *wanted.entry(*variant_id).or_default() += *quantity;
    }

    for (variant_id, quantity) in wanted {
        let variant = lock_variant(conn, variant_id).await?;
        if variant.stock < quantity {
            warn!(sku = %variant.sku, stock = variant.stock, quantity, "insufficient stock");
            return Err(ServiceError::InsufficientStock(variant.sku));
        }

        let result = product_variant::Entity::update_many()
            .col_expr(
                product_variant::Column::Stock,
                Expr::col(product_variant::Column::Stock).sub(quantity),
            )
            .col_expr(
                product_variant::Column::UpdatedAt,
                Expr::value(chrono::Utc::now()),
            )
            .filter(product_variant::Column::Id.eq(variant_id))
            .filter(product_variant::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(sku = %variant.sku, quantity, "stock changed under the lock");
            return Err(ServiceError::InsufficientStock(variant.sku));
        }
        debug!(sku = %variant.sku, quantity, "stock committed");
    }

    Ok(())
}
