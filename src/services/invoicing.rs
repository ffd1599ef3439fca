use crate::entities::{
    invoice::{self, InvoiceStatus},
    order, shipping_address,
};
use crate::errors::ServiceError;
use chrono::{Duration, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, QueryFilter, QuerySelect, Set, SqlErr, TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MAX_SEQUENCE_ATTEMPTS: usize = 3;

pub fn format_invoice_number(sequence: i64) -> String {
    format!("INV-{:06}", sequence)
}

pub async fn invoice_exists<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<bool, ServiceError> {
    Ok(invoice::Entity::find()
        .filter(invoice::Column::OrderId.eq(order_id))
        .one(conn)
        .await?
        .is_some())
}

async fn next_sequence<C: ConnectionTrait>(conn: &C) -> Result<i64, ServiceError> {
    let current: Option<Option<i64>> = invoice::Entity::find()
        .select_only()
        .column_as(Expr::col(invoice::Column::Sequence).max(), "max_sequence")
        .into_tuple()
        .one(conn)
        .await?;
    Ok(current.flatten().unwrap_or(0) + 1)
}

/// Issues invoices inside the caller's transaction
#[derive(Debug, Clone, Copy)]
pub struct InvoiceIssuer {
    due_days: i64,
}

impl InvoiceIssuer {
    pub fn new(due_days: i64) -> Self {
        Self { due_days }
    }

    /// Snapshots the order's amounts and shipping address into a new invoice.
    ///
    /// The sequence is `MAX(sequence) + 1` read inside the transaction; a
    /// collision with a concurrent issuer is retried under a savepoint. An
    /// existing invoice for the same order yields `Conflict`.
    #[instrument(skip(self, txn, order), fields(order_id = %order.id))]
    pub async fn issue(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
    ) -> Result<invoice::Model, ServiceError> {
        let address = shipping_address::Entity::find_by_id(order.shipping_address_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("shipping address".to_string()))?;

        for attempt in 1..=MAX_SEQUENCE_ATTEMPTS {
            let savepoint = txn.begin().await?;
            let sequence = next_sequence(&savepoint).await?;
            let issued_at = Utc::now();

            let model = invoice::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                invoice_number: Set(format_invoice_number(sequence)),
                sequence: Set(sequence),
                billing_address: Set(address.billing_line()),
                subtotal: Set(order.subtotal),
                discount_amount: Set(order.discount_amount),
                tax_amount: Set(order.total_tax),
                total: Set(order.grand_total),
                status: Set(InvoiceStatus::Issued),
                issued_at: Set(issued_at),
                due_date: Set(issued_at + Duration::days(self.due_days)),
            };

            match model.insert(&savepoint).await {
                Ok(invoice) => {
                    savepoint.commit().await?;
                    info!(invoice_number = %invoice.invoice_number, "invoice issued");
                    return Ok(invoice);
                }
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    savepoint.rollback().await?;
                    if invoice_exists(txn, order.id).await? {
                        return Err(ServiceError::Conflict(format!(
                            "invoice already issued for order {}",
                            order.id
                        )));
                    }
                    warn!(attempt, sequence, "invoice sequence taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Conflict(
            "could not allocate an invoice number".to_string(),
        ))
    }
}
