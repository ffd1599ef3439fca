pub mod addresses;
pub mod commerce;
pub mod common;
pub mod orders;
pub mod payment_callbacks;
pub mod vendor;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::{
    addresses::AddressService,
    commerce::{CartService, CheckoutService},
    invoicing::InvoiceIssuer,
    orders::OrderService,
    payments::GatewayRegistry,
    reconciliation::PaymentReconciler,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<PaymentReconciler>,
    pub orders: Arc<OrderService>,
    pub addresses: Arc<AddressService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: &AppConfig,
        registry: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        let issuer = InvoiceIssuer::new(config.invoice_due_days);
        Self {
            cart: Arc::new(CartService::new(db.clone())),
            checkout: Arc::new(CheckoutService::new(
                db.clone(),
                registry.clone(),
                issuer,
                event_sender.clone(),
            )),
            reconciler: Arc::new(PaymentReconciler::new(
                db.clone(),
                registry,
                issuer,
                event_sender,
            )),
            orders: Arc::new(OrderService::new(db.clone())),
            addresses: Arc::new(AddressService::new(db)),
        }
    }
}
