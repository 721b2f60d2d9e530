use crate::errors::ServiceResult;
use crate::models::{PaymentIntent, PaymentIntentId, PaymentStatus};
use crate::provider::PaymentProvider;
use crate::services::poller::StatusSource;
use crate::validation::validate_payment_reference;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Collapses a provider payment-intent state into the four states the
/// browser understands.
pub fn map_provider_status(intent: &PaymentIntent) -> PaymentStatus {
    match intent.status.as_str() {
        "succeeded" => PaymentStatus::Succeeded,
        "canceled" => PaymentStatus::Canceled,
        "requires_payment_method" if intent.last_payment_error.is_some() => PaymentStatus::Failed,
        _ => PaymentStatus::Processing,
    }
}

/// Looks up payment status by payment-intent reference.
#[derive(Clone)]
pub struct PaymentStatusService {
    provider: Arc<dyn PaymentProvider>,
}

impl PaymentStatusService {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self { provider }
    }

    /// Validates an untrusted reference before it reaches the provider.
    #[instrument(skip(self))]
    pub async fn status(&self, raw_reference: &str) -> ServiceResult<PaymentStatus> {
        let reference = validate_payment_reference(raw_reference)?;
        self.status_for(&reference).await
    }

    pub async fn status_for(&self, reference: &PaymentIntentId) -> ServiceResult<PaymentStatus> {
        let intent = self.provider.retrieve_payment_intent(reference).await?;
        let status = map_provider_status(&intent);
        debug!(provider_status = %intent.status, %status, "Payment status resolved");
        Ok(status)
    }
}

#[async_trait]
impl StatusSource for PaymentStatusService {
    async fn query(&self, reference: &PaymentIntentId) -> ServiceResult<PaymentStatus> {
        self.status_for(reference).await
    }
}
