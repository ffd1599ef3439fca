use super::round_money;
use crate::entities::coupon::{self, DiscountType};
use crate::errors::{CouponError, ServiceError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};
use tracing::instrument;
use uuid::Uuid;

/// Facts about the shopper needed to evaluate a coupon
#[derive(Debug, Clone, Copy)]
pub struct CouponContext {
    pub now: DateTime<Utc>,
    pub prior_orders: u64,
}

impl CouponContext {
    pub fn new(now: DateTime<Utc>, prior_orders: u64) -> Self {
        Self { now, prior_orders }
    }
}

/// Applies the coupon rules in order: active, time window, minimum amount,
/// first order. Returns the discount, never more than `subtotal`.
pub fn evaluate_coupon(
    coupon: &coupon::Model,
    subtotal: Decimal,
    ctx: &CouponContext,
) -> Result<Decimal, CouponError> {
    if !coupon.is_active {
        return Err(CouponError::Inactive);
    }
    if !coupon.is_within_window(ctx.now) {
        return Err(CouponError::OutsideWindow);
    }
    if coupon.min_order_amount > Decimal::ZERO && subtotal < coupon.min_order_amount {
        return Err(CouponError::BelowMinimum(round_money(coupon.min_order_amount)));
    }
    if coupon.first_order_only && ctx.prior_orders > 0 {
        return Err(CouponError::FirstOrderOnly);
    }
    if coupon.validate_value().is_err() {
        // Misconfigured rows are refused rather than applied.
        return Err(CouponError::InvalidCode);
    }

    let discount = match coupon.discount_type {
        DiscountType::Percent => round_money(subtotal * coupon.value / Decimal::ONE_HUNDRED),
        DiscountType::Fixed => round_money(coupon.value),
    };
    Ok(discount.min(subtotal))
}

/// Looks up `code` (trimmed, exact match) and gathers the shopper facts its
/// rules need. Prior orders are only counted for first-order coupons.
#[instrument(skip(conn))]
pub async fn load_coupon<C: ConnectionTrait>(
    conn: &C,
    code: &str,
    user_id: Uuid,
) -> Result<(coupon::Model, CouponContext), ServiceError> {
    let code = code.trim();
    let coupon = coupon::Entity::find()
        .filter(coupon::Column::Code.eq(code))
        .one(conn)
        .await?
        .ok_or(CouponError::InvalidCode)?;

    let prior_orders = if coupon.first_order_only {
        crate::entities::order::Entity::find()
            .filter(crate::entities::order::Column::UserId.eq(user_id))
            .count(conn)
            .await?
    } else {
        0
    };

    Ok((coupon, CouponContext::new(Utc::now(), prior_orders)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::pricing::tests::coupon;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn ctx() -> CouponContext {
        CouponContext::new(Utc::now(), 0)
    }

    #[rstest]
    #[case(DiscountType::Percent, dec!(10), dec!(200.00), dec!(20.00))]
    #[case(DiscountType::Percent, dec!(100), dec!(80.00), dec!(80.00))]
    #[case(DiscountType::Percent, dec!(12.5), dec!(33.33), dec!(4.17))]
    #[case(DiscountType::Fixed, dec!(15), dec!(200.00), dec!(15.00))]
    #[case(DiscountType::Fixed, dec!(500), dec!(120.00), dec!(120.00))]
    fn discount_amounts(
        #[case] kind: DiscountType,
        #[case] value: Decimal,
        #[case] subtotal: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_eq!(evaluate_coupon(&coupon(kind, value), subtotal, &ctx()).unwrap(), expected);
    }

    #[test]
    fn inactive_coupon_is_refused() {
        let mut c = coupon(DiscountType::Fixed, dec!(5));
        c.is_active = false;
        assert_matches!(evaluate_coupon(&c, dec!(10), &ctx()), Err(CouponError::Inactive));
    }

    #[test]
    fn expired_and_future_coupons_are_refused() {
        let mut c = coupon(DiscountType::Fixed, dec!(5));
        c.valid_to = Some(Utc::now() - Duration::days(1));
        assert_matches!(evaluate_coupon(&c, dec!(10), &ctx()), Err(CouponError::OutsideWindow));

        c.valid_to = None;
        c.valid_from = Some(Utc::now() + Duration::days(1));
        assert_matches!(evaluate_coupon(&c, dec!(10), &ctx()), Err(CouponError::OutsideWindow));
    }

    #[test]
    fn minimum_amount_is_enforced() {
        let mut c = coupon(DiscountType::Percent, dec!(10));
        c.min_order_amount = dec!(50.00);
        assert_matches!(
            evaluate_coupon(&c, dec!(49.99), &ctx()),
            Err(CouponError::BelowMinimum(min)) if min == dec!(50)
        );
        assert!(evaluate_coupon(&c, dec!(50.00), &ctx()).is_ok());
    }

    #[test]
    fn first_order_only_rejects_returning_customers() {
        let mut c = coupon(DiscountType::Percent, dec!(10));
        c.first_order_only = true;
        assert_matches!(
            evaluate_coupon(&c, dec!(10), &CouponContext::new(Utc::now(), 1)),
            Err(CouponError::FirstOrderOnly)
        );
        assert!(evaluate_coupon(&c, dec!(10), &ctx()).is_ok());
    }

    #[test]
    fn percent_above_hundred_fails_model_validation() {
        let c = coupon(DiscountType::Percent, dec!(101));
        assert!(c.validate_value().is_err());
        assert!(coupon(DiscountType::Percent, dec!(100)).validate_value().is_ok());
        assert!(coupon(DiscountType::Fixed, dec!(-1)).validate_value().is_err());
    }
}
