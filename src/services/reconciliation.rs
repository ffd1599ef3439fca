use crate::entities::{order, order_item, payment, payment::PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::{
    inventory,
    invoicing::{invoice_exists, InvoiceIssuer},
    payments::{GatewayCallback, GatewayRegistry, OutcomeStatus, PaymentMethod, PaymentOutcome},
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    /// Stock committed, invoice issued and order marked paid
    Processed,
    /// The order was already confirmed or the payment already succeeded; nothing was written
    AlreadyProcessed,
    /// A failed outcome was stored on the payment
    Recorded,
    /// The callback carried nothing actionable
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub status: ReconcileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PaymentOutcome>,
}

impl ReconcileResult {
    fn ignored() -> Self {
        Self {
            status: ReconcileStatus::Ignored,
            order_id: None,
            outcome: None,
        }
    }

    fn already_processed(order_id: Uuid, outcome: PaymentOutcome) -> Self {
        Self {
            status: ReconcileStatus::AlreadyProcessed,
            order_id: Some(order_id),
            outcome: Some(outcome),
        }
    }
}

/// Applies gateway callbacks to payments and orders exactly once.
#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DatabaseConnection>,
    registry: Arc<GatewayRegistry>,
    issuer: InvoiceIssuer,
    event_sender: Arc<EventSender>,
}

impl PaymentReconciler {
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

    #[instrument(skip(self, callback))]
    pub async fn reconcile(
        &self,
        gateway_type: &str,
        callback: GatewayCallback,
    ) -> Result<ReconcileResult, ServiceError> {
        let gateway = self.registry.resolve(gateway_type)?;
        let Some(outcome) = gateway.reconcile(&callback).await? else {
            info!(gateway = gateway_type, "callback ignored");
            return Ok(ReconcileResult::ignored());
        };

        let payment = self.find_payment(gateway.method(), &outcome).await?;
        let order_id = payment.order_id;

        // The gateway's verdict commits before any stock or invoice work.
        let txn = self.db.begin().await?;
        let order = lock_order(&txn, order_id).await?;
        if invoice_exists(&txn, order_id).await? {
            info!(%order_id, "order already confirmed; callback is a replay");
            return Ok(ReconcileResult::already_processed(order_id, outcome));
        }

        let current = payment::Entity::find_by_id(payment.id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(payment.id.to_string()))?;
        if outcome.status == OutcomeStatus::Failed && current.status == PaymentStatus::Success {
            info!(%order_id, "failure reported after a successful capture; keeping success");
            return Ok(ReconcileResult::already_processed(order_id, outcome));
        }

        record_outcome(&txn, current, &outcome).await?;
        txn.commit().await?;

        if outcome.status == OutcomeStatus::Failed {
            warn!(%order_id, "payment failed");
            self.event_sender.send_or_log(Event::PaymentFailed {
                order_id,
                user_id: order.user_id,
            });
            return Ok(ReconcileResult {
                status: ReconcileStatus::Recorded,
                order_id: Some(order_id),
                outcome: Some(outcome),
            });
        }

        self.confirm_order(order_id, outcome).await
    }

    /// Commits stock, issues the invoice and marks the order paid in one
    /// transaction. Rechecks the invoice guard under the order lock.
    async fn confirm_order(
        &self,
        order_id: Uuid,
        outcome: PaymentOutcome,
    ) -> Result<ReconcileResult, ServiceError> {
        let txn = self.db.begin().await?;
        let order = lock_order(&txn, order_id).await?;
        if invoice_exists(&txn, order_id).await? {
            info!(%order_id, "concurrent reconciliation already confirmed the order");
            return Ok(ReconcileResult::already_processed(order_id, outcome));
        }

        if !order.status.can_transition_to(order::OrderStatus::Paid) {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is {:?} and cannot be marked paid",
                order_id, order.status
            )));
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        let lines: Vec<(Uuid, i32)> = items.iter().map(|i| (i.variant_id, i.quantity)).collect();
        if let Err(e) = inventory::commit_stock(&txn, &lines).await {
            warn!(%order_id, error = %e, "payment captured but stock could not be committed");
            return Err(e);
        }

        match self.issuer.issue(&txn, &order).await {
            Ok(_) => {}
            Err(ServiceError::Conflict(message)) => {
                if invoice_exists(&txn, order_id).await? {
                    info!(%order_id, "concurrent reconciliation won; rolling back");
                    return Ok(ReconcileResult::already_processed(order_id, outcome));
                }
                return Err(ServiceError::Conflict(message));
            }
            Err(e) => return Err(e),
        }

        let user_id = order.user_id;
        let mut active: order::ActiveModel = order.into();
        active.status = Set(order::OrderStatus::Paid);
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        txn.commit().await?;
        info!(%order_id, "payment confirmed");

        self.event_sender
            .send_or_log(Event::OrderConfirmed { order_id, user_id });

        Ok(ReconcileResult {
            status: ReconcileStatus::Processed,
            order_id: Some(order_id),
            outcome: Some(outcome),
        })
    }

    /// Transaction id first, then the gateway's order reference.
    async fn find_payment(
        &self,
        method: PaymentMethod,
        outcome: &PaymentOutcome,
    ) -> Result<payment::Model, ServiceError> {
        if let Some(txn_id) = &outcome.transaction_id {
            if let Some(found) = payment::Entity::find()
                .filter(payment::Column::Method.eq(method))
                .filter(payment::Column::TransactionId.eq(txn_id.as_str()))
                .one(&*self.db)
                .await?
            {
                return Ok(found);
            }
        }
        if let Some(external_id) = &outcome.external_order_id {
            if let Some(found) = payment::Entity::find()
                .filter(payment::Column::Method.eq(method))
                .filter(payment::Column::GatewayOrderId.eq(external_id.as_str()))
                .one(&*self.db)
                .await?
            {
                return Ok(found);
            }
        }

        let reference = outcome
            .transaction_id
            .as_deref()
            .or(outcome.external_order_id.as_deref())
            .unwrap_or_default()
            .to_string();
        warn!(%method, reference = %reference, "no payment matches callback");
        Err(ServiceError::PaymentNotFound(reference))
    }
}

async fn lock_order(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
}

async fn record_outcome(
    txn: &DatabaseTransaction,
    payment: payment::Model,
    outcome: &PaymentOutcome,
) -> Result<payment::Model, ServiceError> {
    let mut active: payment::ActiveModel = payment.into();
    if let Some(txn_id) = &outcome.transaction_id {
        active.transaction_id = Set(Some(txn_id.clone()));
    }
    active.status = Set(outcome.status.into());
    active.updated_at = Set(Utc::now());
    Ok(active.update(txn).await?)
}
