//! Cart store and the checkout that turns a cart into an order

pub mod cart_service;
pub mod checkout_service;

pub use cart_service::{CartLine, CartOwner, CartService, CartView, MergeSummary};
pub use checkout_service::{CheckoutService, CreateOrderInput, PlacedOrder};
