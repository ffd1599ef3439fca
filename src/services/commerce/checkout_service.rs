use crate::{
    entities::{
        commerce::{cart, cart_item, product, Cart, CartItem, Product},
        invoice, order, order_item, payment, shipping_address,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        commerce::cart_service::cart_lines,
        inventory,
        invoicing::InvoiceIssuer,
        payments::{GatewayHandle, GatewayRegistry, PaymentRequest},
        pricing::{compute_totals, load_coupon, taxes::active_taxes, OrderTotals},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

fn default_payment_method() -> String {
    "cod".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateOrderInput {
    pub shipping_address_id: Uuid,
    #[validate(length(max = 50))]
    pub coupon_code: Option<String>,
    #[serde(default = "default_payment_method")]
    #[validate(length(min = 1, max = 20))]
    pub payment_method: String,
}

/// Result of a successful checkout
#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment: payment::Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<invoice::Model>,
    pub handle: GatewayHandle,
}

/// Turns a user's cart into an order, payment and, for methods that settle
/// immediately, committed stock and an invoice.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    registry: Arc<GatewayRegistry>,
    issuer: InvoiceIssuer,
    event_sender: Arc<EventSender>,
}

struct PricedLine {
    variant_id: Uuid,
    vendor_id: Uuid,
    sku: String,
    quantity: i32,
    unit_price: Decimal,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<GatewayRegistry>,
        issuer: InvoiceIssuer,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            registry,
            issuer,
            event_sender,
        }
    }

    /// Prices at current variant prices, so a price change after add-to-cart is
    /// charged at the new price.
    async fn price_cart(&self, cart_id: Uuid) -> Result<Vec<PricedLine>, ServiceError> {
        let lines = cart_lines(&*self.db, cart_id).await?;
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let product_ids: Vec<Uuid> = lines.iter().map(|(_, v)| v.product_id).collect();
        let vendors: HashMap<Uuid, Uuid> = Product::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|p| (p.id, p.vendor_id))
            .collect();

        lines
            .into_iter()
            .map(|(item, variant)| {
                let vendor_id = *vendors.get(&variant.product_id).ok_or_else(|| {
                    ServiceError::NotFound(format!("product {}", variant.product_id))
                })?;
                Ok(PricedLine {
                    variant_id: variant.id,
                    vendor_id,
                    unit_price: variant.effective_price(),
                    sku: variant.sku,
                    quantity: item.quantity,
                })
            })
            .collect()
    }

    #[instrument(skip(self, input), fields(method = %input.payment_method))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<PlacedOrder, ServiceError> {
        input.validate()?;

        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::EmptyCart)?;

        let address = shipping_address::Entity::find_by_id(input.shipping_address_id)
            .filter(shipping_address::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("shipping address".to_string()))?;

        let lines = self.price_cart(cart.id).await?;
        let subtotal: Decimal = lines
            .iter()
            .map(|l| l.unit_price * Decimal::from(l.quantity))
            .sum();

        let coupon_code = input
            .coupon_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let coupon = match &coupon_code {
            Some(code) => Some(load_coupon(&*self.db, code, user_id).await?),
            None => None,
        };
        let taxes = active_taxes(&*self.db).await?;
        let totals: OrderTotals = compute_totals(
            subtotal,
            coupon.as_ref().map(|(c, ctx)| (c, ctx)),
            &taxes,
        )?;

        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            shipping_address_id: Set(address.id),
            status: Set(order::OrderStatus::Pending),
            subtotal: Set(totals.subtotal),
            discount_amount: Set(totals.discount_amount),
            total_tax: Set(totals.total_tax),
            grand_total: Set(totals.grand_total),
            coupon_code: Set(coupon_code),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let items: Vec<order_item::Model> = lines
            .iter()
            .map(|l| order_item::Model {
                id: Uuid::new_v4(),
                order_id: order.id,
                variant_id: l.variant_id,
                vendor_id: l.vendor_id,
                sku: l.sku.clone(),
                quantity: l.quantity,
                unit_price: l.unit_price,
            })
            .collect();
        order_item::Entity::insert_many(items.iter().map(|item| order_item::ActiveModel {
            id: Set(item.id),
            order_id: Set(item.order_id),
            variant_id: Set(item.variant_id),
            vendor_id: Set(item.vendor_id),
            sku: Set(item.sku.clone()),
            quantity: Set(item.quantity),
            unit_price: Set(item.unit_price),
        }))
        .exec(&txn)
        .await?;

        let gateway = self.registry.resolve(&input.payment_method)?;
        let handle = gateway
            .initiate(&PaymentRequest {
                order: &order,
                amount: totals.grand_total,
                shipping: &address,
            })
            .await?;

        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            method: Set(gateway.method()),
            provider: Set(gateway.provider_name().map(str::to_string)),
            amount: Set(totals.grand_total),
            status: Set(handle.status),
            gateway_order_id: Set(handle.external_order_id.clone()),
            transaction_id: Set(handle.transaction_id.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let invoice = if handle.is_settled() {
            let stock: Vec<(Uuid, i32)> = lines.iter().map(|l| (l.variant_id, l.quantity)).collect();
            inventory::commit_stock(&txn, &stock).await?;
            Some(self.issuer.issue(&txn, &order).await?)
        } else {
            None
        };

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        info!(
            order_id = %order.id,
            grand_total = %order.grand_total,
            settled = handle.is_settled(),
            "order created"
        );

        self.event_sender.send_or_log(Event::OrderCreated {
            order_id: order.id,
            user_id,
        });
        if invoice.is_some() {
            self.event_sender.send_or_log(Event::OrderConfirmed {
                order_id: order.id,
                user_id,
            });
        }

        Ok(PlacedOrder {
            order,
            items,
            payment,
            invoice,
            handle,
        })
    }
}
