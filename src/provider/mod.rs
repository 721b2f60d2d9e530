//! Payment provider abstraction.
//!
//! The provider owns checkout pages, payment intents, coupons and promotion
//! codes. Everything in this crate talks to it through [`PaymentProvider`].

pub mod in_memory;
pub mod stripe;

use crate::config::{PaymentConfig, PricingConfig};
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{
    CheckoutRequest, Coupon, NewCoupon, NewPromotionCode, PaymentIntent, PaymentIntentId,
    PromotionCode, ProviderSession,
};
use async_trait::async_trait;
use std::sync::Arc;

pub use in_memory::InMemoryPaymentProvider;
pub use stripe::StripeProvider;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout session.
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ServiceResult<ProviderSession>;

    async fn retrieve_payment_intent(&self, id: &PaymentIntentId) -> ServiceResult<PaymentIntent>;

    /// Every promotion code, active or not, whose code string matches `code`.
    async fn list_promotion_codes(&self, code: &str) -> ServiceResult<Vec<PromotionCode>>;

    /// Every active promotion code, whatever its code string.
    async fn list_active_promotion_codes(&self) -> ServiceResult<Vec<PromotionCode>>;

    async fn create_promotion_code(
        &self,
        new_code: &NewPromotionCode,
    ) -> ServiceResult<PromotionCode>;

    /// Rebind an existing promotion code to another coupon. Providers that
    /// do not allow this answer with [`ServiceError::UpstreamRejection`].
    async fn update_promotion_code_coupon(
        &self,
        promotion_code_id: &str,
        coupon_id: &str,
    ) -> ServiceResult<PromotionCode>;

    async fn deactivate_promotion_code(&self, promotion_code_id: &str)
        -> ServiceResult<PromotionCode>;

    async fn delete_promotion_code(&self, promotion_code_id: &str) -> ServiceResult<()>;

    /// `None` when the coupon does not exist.
    async fn retrieve_coupon(&self, coupon_id: &str) -> ServiceResult<Option<Coupon>>;

    async fn list_coupons(&self) -> ServiceResult<Vec<Coupon>>;

    async fn create_coupon(&self, new_coupon: &NewCoupon) -> ServiceResult<Coupon>;

    async fn delete_coupon(&self, coupon_id: &str) -> ServiceResult<()>;
}

/// Builds the provider selected by `payment.backend`. The in-memory backend
/// starts with every configured tier already in place.
pub fn provider_from_config(
    config: &PaymentConfig,
    pricing: &PricingConfig,
) -> ServiceResult<Arc<dyn PaymentProvider>> {
    if config.uses_stripe() {
        Ok(Arc::new(StripeProvider::new(config)?))
    } else if config.backend.eq_ignore_ascii_case("in-memory") {
        Ok(Arc::new(InMemoryPaymentProvider::seeded(
            &pricing.tiers,
            &pricing.currency,
        )))
    } else {
        Err(ServiceError::Configuration(format!(
            "unknown payment backend '{}'",
            config.backend
        )))
    }
}
