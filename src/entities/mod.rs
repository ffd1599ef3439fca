pub mod commerce;
pub mod coupon;
pub mod invoice;
pub mod order;
pub mod order_item;
pub mod payment;
pub mod shipping_address;
pub mod tax;
