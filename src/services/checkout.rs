use crate::config::{PaymentConfig, PricingConfig};
use crate::errors::ServiceResult;
use crate::middleware_helpers::retry::{with_retry, RetryConfig, UpstreamRetryPolicy};
use crate::models::{
    canonical_code, cents_to_amount, CheckoutRequest, CheckoutSession, LeadRecord,
};
use crate::provider::PaymentProvider;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Decides which promotion code, if any, accompanies a checkout request.
#[async_trait]
pub trait PromotionValidator: Send + Sync {
    /// Returns the code to forward, `None` to proceed without a code, or an
    /// error when checkout must not start with it.
    async fn admit(&self, code: &str) -> ServiceResult<Option<String>>;
}

/// Leaves every judgement to the payment provider: the canonical code is
/// forwarded as-is and accepted or refused when the session is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderPromotionValidator;

#[async_trait]
impl PromotionValidator for ProviderPromotionValidator {
    async fn admit(&self, code: &str) -> ServiceResult<Option<String>> {
        let code = canonical_code(code);
        Ok((!code.is_empty()).then_some(code))
    }
}

/// Creates hosted checkout sessions for the single course price.
#[derive(Clone)]
pub struct CheckoutService {
    provider: Arc<dyn PaymentProvider>,
    promotions: Arc<dyn PromotionValidator>,
    payment: PaymentConfig,
    pricing: PricingConfig,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        promotions: Arc<dyn PromotionValidator>,
        payment: PaymentConfig,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            provider,
            promotions,
            payment,
            pricing,
        }
    }

    /// Checkout for a freshly captured lead. The lead's email becomes the
    /// session's customer email and its id, name, phone and any referral
    /// attribution session metadata.
    #[instrument(skip(self, lead), fields(lead_id = ?lead.map(|l| l.id)))]
    pub async fn create_checkout_session(
        &self,
        lead: Option<&LeadRecord>,
        promotion_code: Option<&str>,
    ) -> ServiceResult<CheckoutSession> {
        let mut metadata = BTreeMap::new();
        let customer_email = lead.map(|record| {
            metadata.insert("lead_id".to_string(), record.id.to_string());
            metadata.insert("name".to_string(), record.lead.name.clone());
            metadata.insert("phone".to_string(), record.lead.phone.clone());
            let referral = &record.lead.referral;
            if !referral.is_empty() {
                for (key, value) in [
                    ("referrer", &referral.referrer),
                    ("utm_source", &referral.utm_source),
                    ("utm_campaign", &referral.utm_campaign),
                ] {
                    if let Some(value) = value {
                        metadata.insert(key.to_string(), value.clone());
                    }
                }
            }
            record.lead.email.clone()
        });

        self.start(customer_email, metadata, promotion_code).await
    }

    /// Checkout started directly from the pricing page, without a lead.
    #[instrument(skip(self, customer_email))]
    pub async fn create_guest_checkout_session(
        &self,
        customer_email: Option<String>,
        promotion_code: Option<&str>,
    ) -> ServiceResult<CheckoutSession> {
        self.start(customer_email, BTreeMap::new(), promotion_code)
            .await
    }

    async fn start(
        &self,
        customer_email: Option<String>,
        metadata: BTreeMap<String, String>,
        promotion_code: Option<&str>,
    ) -> ServiceResult<CheckoutSession> {
        let promotion_code = match promotion_code {
            Some(code) => self.promotions.admit(code).await?,
            None => None,
        };

        let request = CheckoutRequest {
            price_id: self.payment.price_id.clone(),
            success_url: self.payment.success_url.clone(),
            cancel_url: self.payment.cancel_url.clone(),
            customer_email,
            promotion_code: promotion_code.clone(),
            metadata,
        };

        let retry = RetryConfig::attempts(
            self.payment.session_create_attempts,
            self.payment.retry_backoff(),
        );
        let provider = &self.provider;
        let request_ref = &request;
        let session = with_retry(&retry, UpstreamRetryPolicy, move || {
            provider.create_checkout_session(request_ref)
        })
        .await
        .map_err(|e| {
            warn!(error = %e, promotion_code = ?request.promotion_code, "Checkout session creation failed");
            counter!("enrollment_checkout.failures", 1);
            e.into_checkout_failure()
        })?;

        let discount = promotion_code
            .as_deref()
            .and_then(|code| self.pricing.tier_for_code(code))
            .map(|tier| cents_to_amount(tier.amount_off_cents));

        counter!("enrollment_checkout.sessions_created", 1);
        info!(session_id = %session.id, "Checkout session created");

        Ok(CheckoutSession {
            session_id: session.id,
            redirect_url: session.url,
            promotion_code,
            base_price: cents_to_amount(self.pricing.base_price_cents),
            discount,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use crate::models::{Lead, ProviderSession, Referral, StorageDriver};
    use crate::provider::MockPaymentProvider;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn service(provider: MockPaymentProvider) -> CheckoutService {
        let payment = PaymentConfig {
            retry_backoff_ms: 10,
            ..Default::default()
        };
        CheckoutService::new(
            Arc::new(provider),
            Arc::new(ProviderPromotionValidator),
            payment,
            PricingConfig::default(),
        )
    }

    fn session() -> ProviderSession {
        ProviderSession {
            id: "cs_test_1".into(),
            url: "https://checkout.example/pay/cs_test_1".into(),
        }
    }

    fn record() -> LeadRecord {
        LeadRecord {
            id: Uuid::new_v4(),
            lead: Lead {
                name: "Ada Lovelace".into(),
                email: "ada@example.com".into(),
                phone: "5551234567".into(),
                referral: Default::default(),
                created_at: Utc::now(),
            },
            storage_driver: StorageDriver::Sqlite,
        }
    }

    #[tokio::test]
    async fn forwards_canonical_code_and_lead_details() {
        let lead = record();
        let lead_id = lead.id.to_string();
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .withf(move |req| {
                req.promotion_code.as_deref() == Some("EARLY36")
                    && req.customer_email.as_deref() == Some("ada@example.com")
                    && req.metadata.get("lead_id") == Some(&lead_id)
                    && req.price_id == "price_course_enrollment"
            })
            .times(1)
            .returning(|_| Ok(session()));

        let created = service(provider)
            .create_checkout_session(Some(&lead), Some("  early36 "))
            .await
            .unwrap();

        assert_eq!(created.session_id, "cs_test_1");
        assert_eq!(created.promotion_code.as_deref(), Some("EARLY36"));
        assert_eq!(created.base_price, Decimal::new(33_300, 2));
        assert_eq!(created.discount, Some(Decimal::new(29_700, 2)));
    }

    #[tokio::test]
    async fn referral_attribution_travels_as_metadata() {
        let mut lead = record();
        lead.lead.referral = Referral {
            referrer: None,
            utm_source: Some("newsletter".into()),
            utm_campaign: Some("spring".into()),
        };
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .withf(|req| {
                req.metadata.get("utm_source").map(String::as_str) == Some("newsletter")
                    && req.metadata.get("utm_campaign").map(String::as_str) == Some("spring")
                    && !req.metadata.contains_key("referrer")
            })
            .times(1)
            .returning(|_| Ok(session()));

        service(provider)
            .create_checkout_session(Some(&lead), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn leads_without_referral_carry_no_attribution() {
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .withf(|req| req.metadata.len() == 3 && !req.metadata.contains_key("utm_source"))
            .times(1)
            .returning(|_| Ok(session()));

        service(provider)
            .create_checkout_session(Some(&record()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_codes_are_still_forwarded_without_discount() {
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .withf(|req| req.promotion_code.as_deref() == Some("FRIENDS"))
            .returning(|_| Ok(session()));

        let created = service(provider)
            .create_guest_checkout_session(None, Some("friends"))
            .await
            .unwrap();
        assert_eq!(created.discount, None);
    }

    #[tokio::test]
    async fn blank_code_is_dropped() {
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .withf(|req| req.promotion_code.is_none())
            .returning(|_| Ok(session()));

        let created = service(provider)
            .create_guest_checkout_session(None, Some("   "))
            .await
            .unwrap();
        assert_eq!(created.promotion_code, None);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .times(2)
            .returning(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ServiceError::UpstreamTimeout("slow".into()))
                } else {
                    Ok(session())
                }
            });

        let created = service(provider)
            .create_guest_checkout_session(None, None)
            .await
            .unwrap();
        assert_eq!(created.session_id, "cs_test_1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejections_are_not_retried_and_hide_provider_detail() {
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .times(1)
            .returning(|_| {
                Err(ServiceError::UpstreamRejection(
                    "No such promotion code: 'BOGUS'".into(),
                ))
            });

        let err = service(provider)
            .create_guest_checkout_session(None, Some("BOGUS"))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert!(matches!(err, ServiceError::CheckoutFailed(_)));
        assert!(!err.response_message().contains("BOGUS"));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_timeouts_stay_retryable() {
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_checkout_session()
            .times(2)
            .returning(|_| Err(ServiceError::UpstreamTimeout("slow".into())));

        let err = service(provider)
            .create_guest_checkout_session(None, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }
}
