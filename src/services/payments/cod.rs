use super::{
    GatewayCallback, GatewayHandle, PaymentGateway, PaymentMethod, PaymentOutcome, PaymentRequest,
    PaymentStatus,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use uuid::Uuid;

/// Cash on delivery. Settles at checkout and never receives callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodGateway;

#[async_trait]
impl PaymentGateway for CodGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Cod
    }

    fn provider_name(&self) -> Option<&'static str> {
        None
    }

    async fn initiate(&self, _request: &PaymentRequest<'_>) -> Result<GatewayHandle, ServiceError> {
        Ok(GatewayHandle {
            status: PaymentStatus::Success,
            redirect_url: None,
            external_order_id: None,
            transaction_id: Some(Uuid::new_v4().to_string()),
        })
    }

    async fn reconcile(
        &self,
        _callback: &GatewayCallback,
    ) -> Result<Option<PaymentOutcome>, ServiceError> {
        Ok(None)
    }
}
