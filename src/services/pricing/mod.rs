//! Pure money arithmetic for checkout: coupons, taxes and per-vendor shares

pub mod coupons;
pub mod taxes;
pub mod vendor_totals;

use crate::entities::{coupon, tax};
use crate::errors::CouponError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

pub use coupons::{evaluate_coupon, load_coupon, CouponContext};
pub use taxes::compute_tax;
pub use vendor_totals::{compute_vendor_totals, VendorTotals};

/// Rounds to cents, midpoint away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Priced snapshot of a cart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub total_tax: Decimal,
    pub grand_total: Decimal,
}

/// `grand_total = subtotal - discount + tax`, with the discount clamped to the subtotal.
pub fn compute_totals(
    subtotal: Decimal,
    coupon: Option<(&coupon::Model, &CouponContext)>,
    taxes: &[tax::Model],
) -> Result<OrderTotals, CouponError> {
    let subtotal = round_money(subtotal);
    let discount_amount = match coupon {
        Some((coupon, ctx)) => evaluate_coupon(coupon, subtotal, ctx)?,
        None => Decimal::ZERO,
    };
    let total_tax = compute_tax(subtotal - discount_amount, taxes);
    Ok(OrderTotals {
        subtotal,
        discount_amount,
        total_tax,
        grand_total: subtotal - discount_amount + total_tax,
    })
}
