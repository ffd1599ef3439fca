// Checkout orchestration
pub mod commerce;
pub mod reconciliation;

// Money and stock
pub mod inventory;
pub mod invoicing;
pub mod pricing;

// Gateways
pub mod payments;

// Read models and address book
pub mod addresses;
pub mod orders;
