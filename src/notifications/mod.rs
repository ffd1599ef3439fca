use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Customer-facing order notifications. Delivery (email, push) lives outside this service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn order_placed(&self, order_id: Uuid, user_id: Uuid) -> Result<(), NotificationError>;
    async fn order_confirmed(&self, order_id: Uuid, user_id: Uuid)
        -> Result<(), NotificationError>;
    async fn payment_failed(&self, order_id: Uuid, user_id: Uuid) -> Result<(), NotificationError>;
}

/// Default notifier: writes a structured log line per notification.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl OrderNotifier for LoggingNotifier {
    async fn order_placed(&self, order_id: Uuid, user_id: Uuid) -> Result<(), NotificationError> {
        info!(%order_id, %user_id, kind = "order_placed", "notification dispatched");
        Ok(())
    }

    async fn order_confirmed(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), NotificationError> {
        info!(%order_id, %user_id, kind = "order_confirmed", "notification dispatched");
        Ok(())
    }

    async fn payment_failed(&self, order_id: Uuid, user_id: Uuid) -> Result<(), NotificationError> {
        info!(%order_id, %user_id, kind = "payment_failed", "notification dispatched");
        Ok(())
    }
}
