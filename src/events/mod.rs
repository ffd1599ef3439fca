use crate::notifications::OrderNotifier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Domain events emitted after a checkout or reconciliation commits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated { order_id: Uuid, user_id: Uuid },
    /// Stock committed and invoice issued
    OrderConfirmed { order_id: Uuid, user_id: Uuid },
    PaymentFailed { order_id: Uuid, user_id: Uuid },
}

impl Event {
    pub fn order_id(&self) -> Uuid {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderConfirmed { order_id, .. }
            | Event::PaymentFailed { order_id, .. } => *order_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Queues an event without waiting. A full or closed channel drops it with a warning.
    pub fn send_or_log(&self, event: Event) {
        let order_id = event.order_id();
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%order_id, "event channel full; dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%order_id, "event channel closed; dropping event");
            }
        }
    }
}

/// Consumes events until every sender is dropped. Notifier failures are logged and swallowed.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn OrderNotifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(?event, "Received event");

        let result = match &event {
            Event::OrderCreated { order_id, user_id } => {
                notifier.order_placed(*order_id, *user_id).await
            }
            Event::OrderConfirmed { order_id, user_id } => {
                notifier.order_confirmed(*order_id, *user_id).await
            }
            Event::PaymentFailed { order_id, user_id } => {
                notifier.payment_failed(*order_id, *user_id).await
            }
        };

        if let Err(e) = result {
            error!(order_id = %event.order_id(), error = %e, "Failed to deliver notification");
        }
    }

    info!("Event processing loop stopped");
}
