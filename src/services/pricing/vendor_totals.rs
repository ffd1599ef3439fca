use super::{compute_tax, round_money};
use crate::entities::{order, order_item, tax};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// A vendor's share of one order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VendorTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// The order discount is allocated in proportion to the vendor's share of the
/// order subtotal; tax is recomputed on the vendor's discounted amount.
pub fn compute_vendor_totals(
    order: &order::Model,
    items: &[order_item::Model],
    vendor_id: Uuid,
    active_taxes: &[tax::Model],
) -> VendorTotals {
    let subtotal: Decimal = items
        .iter()
        .filter(|item| item.vendor_id == vendor_id)
        .map(order_item::Model::line_total)
        .sum();

    let discount = if order.subtotal.is_zero() {
        Decimal::ZERO
    } else {
        round_money(order.discount_amount * subtotal / order.subtotal).min(subtotal)
    };

    let tax = compute_tax(subtotal - discount, active_taxes);
    VendorTotals {
        subtotal,
        discount,
        tax,
        total: subtotal - discount + tax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::OrderStatus;
    use crate::entities::tax::TaxType;
    use crate::services::pricing::tests::tax;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn item(order_id: Uuid, vendor_id: Uuid, price: Decimal, qty: i32) -> order_item::Model {
        order_item::Model {
            id: Uuid::new_v4(),
            order_id,
            variant_id: Uuid::new_v4(),
            vendor_id,
            sku: "SKU".into(),
            quantity: qty,
            unit_price: price,
        }
    }

    fn order(subtotal: Decimal, discount: Decimal) -> order::Model {
        order::Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            shipping_address_id: Uuid::new_v4(),
            status: OrderStatus::Paid,
            subtotal,
            discount_amount: discount,
            total_tax: Decimal::ZERO,
            grand_total: subtotal - discount,
            coupon_code: Some("SAVE".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn discount_is_split_by_share() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let o = order(dec!(200.00), dec!(20.00));
        let items = vec![
            item(o.id, a, dec!(50.00), 3),
            item(o.id, b, dec!(50.00), 1),
        ];
        let taxes = vec![tax(TaxType::Percentage, dec!(10))];

        let va = compute_vendor_totals(&o, &items, a, &taxes);
        assert_eq!(va.subtotal, dec!(150.00));
        assert_eq!(va.discount, dec!(15.00));
        assert_eq!(va.tax, dec!(13.50));
        assert_eq!(va.total, dec!(148.50));

        let vb = compute_vendor_totals(&o, &items, b, &taxes);
        assert_eq!(vb.discount, dec!(5.00));
        assert_eq!(va.discount + vb.discount, o.discount_amount);
    }

    #[test]
    fn vendor_without_items_has_zero_totals() {
        let o = order(dec!(0), dec!(0));
        let totals = compute_vendor_totals(&o, &[], Uuid::new_v4(), &[]);
        assert_eq!(totals.total, Decimal::ZERO);
    }
}
