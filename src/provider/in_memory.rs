use super::PaymentProvider;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{
    CheckoutRequest, Coupon, DiscountTier, NewCoupon, NewPromotionCode, PaymentIntent,
    PaymentIntentId, PromotionCode, ProviderSession,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Failure the in-memory provider can be told to produce on the next checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFault {
    Timeout,
    Unavailable,
    Rejection,
}

impl ProviderFault {
    fn into_error(self) -> ServiceError {
        match self {
            ProviderFault::Timeout => ServiceError::UpstreamTimeout("simulated timeout".into()),
            ProviderFault::Unavailable => {
                ServiceError::UpstreamUnavailable("simulated outage".into())
            }
            ProviderFault::Rejection => {
                ServiceError::UpstreamRejection("simulated rejection".into())
            }
        }
    }
}

/// Process-local provider used in development and tests.
///
/// Behaves like the hosted provider where the rest of the crate can observe
/// it: promotion codes are judged at checkout, codes with redemptions cannot
/// be deleted, unknown payment intents are not found.
#[derive(Clone, Default)]
pub struct InMemoryPaymentProvider {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: DashMap<String, CheckoutRequest>,
    payment_intents: DashMap<String, PaymentIntent>,
    promotion_codes: DashMap<String, PromotionCode>,
    coupons: DashMap<String, Coupon>,
    next_id: AtomicU64,
    refuse_rebinding: AtomicBool,
    refuse_deletes: AtomicBool,
    checkout_faults: Mutex<VecDeque<ProviderFault>>,
}

impl InMemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the coupon and promotion code for every tier.
    pub fn seeded(tiers: &[DiscountTier], currency: &str) -> Self {
        let provider = Self::new();
        for tier in tiers {
            provider.insert_coupon(Coupon {
                id: tier.coupon_id.clone(),
                amount_off_cents: tier.amount_off_cents,
                currency: currency.to_string(),
                max_redemptions: Some(tier.max_redemptions),
                times_redeemed: 0,
                valid: true,
            });
            let id = provider.next_id("promo");
            provider.insert_promotion_code(PromotionCode {
                id,
                code: tier.code.clone(),
                coupon_id: tier.coupon_id.clone(),
                max_redemptions: Some(tier.max_redemptions),
                times_redeemed: 0,
                active: true,
            });
        }
        provider
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_{:024}", prefix, n)
    }

    pub fn insert_coupon(&self, coupon: Coupon) {
        self.inner.coupons.insert(coupon.id.clone(), coupon);
    }

    pub fn insert_promotion_code(&self, promo: PromotionCode) {
        self.inner.promotion_codes.insert(promo.id.clone(), promo);
    }

    pub fn set_payment_intent(&self, id: &str, status: &str, last_payment_error: Option<&str>) {
        self.inner.payment_intents.insert(
            id.to_string(),
            PaymentIntent {
                id: id.to_string(),
                status: status.to_string(),
                last_payment_error: last_payment_error.map(str::to_string),
            },
        );
    }

    /// Makes in-place promotion code rebinding fail like providers that forbid it.
    pub fn refuse_rebinding(&self, refuse: bool) {
        self.inner.refuse_rebinding.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_deletes(&self, refuse: bool) {
        self.inner.refuse_deletes.store(refuse, Ordering::SeqCst);
    }

    /// Queues a failure for an upcoming checkout session request.
    pub fn push_checkout_fault(&self, fault: ProviderFault) {
        if let Ok(mut faults) = self.inner.checkout_faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Checkout requests accepted so far.
    pub fn sessions(&self) -> Vec<(String, CheckoutRequest)> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    pub fn promotion_codes(&self) -> Vec<PromotionCode> {
        let mut codes: Vec<_> = self
            .inner
            .promotion_codes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        codes.sort_by(|a, b| a.id.cmp(&b.id));
        codes
    }

    pub fn coupon(&self, id: &str) -> Option<Coupon> {
        self.inner.coupons.get(id).map(|c| c.value().clone())
    }

    fn take_checkout_fault(&self) -> Option<ProviderFault> {
        self.inner
            .checkout_faults
            .lock()
            .ok()
            .and_then(|mut faults| faults.pop_front())
    }

    fn redeemable_code(&self, code: &str) -> ServiceResult<PromotionCode> {
        let promo = self
            .inner
            .promotion_codes
            .iter()
            .map(|entry| entry.value().clone())
            .find(|promo| promo.active && promo.matches(code))
            .ok_or_else(|| {
                ServiceError::UpstreamRejection(format!("No such promotion code: '{}'", code))
            })?;

        let coupon = self.coupon(&promo.coupon_id).ok_or_else(|| {
            ServiceError::UpstreamRejection(format!("No such coupon: '{}'", promo.coupon_id))
        })?;

        let exhausted = |max: Option<u32>, used: u32| max.map_or(false, |max| used >= max);
        if !coupon.valid
            || exhausted(coupon.max_redemptions, coupon.times_redeemed)
            || exhausted(promo.max_redemptions, promo.times_redeemed)
        {
            return Err(ServiceError::UpstreamRejection(format!(
                "Promotion code '{}' is no longer redeemable",
                code
            )));
        }

        Ok(promo)
    }

    fn update_code<F>(&self, id: &str, apply: F) -> ServiceResult<PromotionCode>
    where
        F: FnOnce(&mut PromotionCode),
    {
        let mut entry = self.inner.promotion_codes.get_mut(id).ok_or_else(|| {
            ServiceError::UpstreamRejection(format!("No such promotion code: '{}'", id))
        })?;
        apply(entry.value_mut());
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ServiceResult<ProviderSession> {
        if let Some(fault) = self.take_checkout_fault() {
            return Err(fault.into_error());
        }

        if let Some(code) = &request.promotion_code {
            self.redeemable_code(code)?;
        }

        let id = self.next_id("cs_test");
        self.inner.sessions.insert(id.clone(), request.clone());
        debug!(session_id = %id, "Created in-memory checkout session");

        Ok(ProviderSession {
            url: format!("https://checkout.local/pay/{}", id),
            id,
        })
    }

    async fn retrieve_payment_intent(&self, id: &PaymentIntentId) -> ServiceResult<PaymentIntent> {
        self.inner
            .payment_intents
            .get(id.as_str())
            .map(|intent| intent.value().clone())
            .ok_or_else(|| ServiceError::NotFound(format!("payment intent {}", id)))
    }

    async fn list_promotion_codes(&self, code: &str) -> ServiceResult<Vec<PromotionCode>> {
        Ok(self
            .promotion_codes()
            .into_iter()
            .filter(|promo| promo.matches(code))
            .collect())
    }

    async fn list_active_promotion_codes(&self) -> ServiceResult<Vec<PromotionCode>> {
        Ok(self
            .promotion_codes()
            .into_iter()
            .filter(|promo| promo.active)
            .collect())
    }

    async fn create_promotion_code(
        &self,
        new_code: &NewPromotionCode,
    ) -> ServiceResult<PromotionCode> {
        if !self.inner.coupons.contains_key(&new_code.coupon_id) {
            return Err(ServiceError::UpstreamRejection(format!(
                "No such coupon: '{}'",
                new_code.coupon_id
            )));
        }
        let has_active_twin = self
            .inner
            .promotion_codes
            .iter()
            .any(|entry| entry.active && entry.matches(&new_code.code));
        if has_active_twin {
            return Err(ServiceError::UpstreamRejection(format!(
                "An active promotion code with code '{}' already exists",
                new_code.code
            )));
        }

        let promo = PromotionCode {
            id: self.next_id("promo"),
            code: new_code.code.clone(),
            coupon_id: new_code.coupon_id.clone(),
            max_redemptions: Some(new_code.max_redemptions),
            times_redeemed: 0,
            active: true,
        };
        self.insert_promotion_code(promo.clone());
        Ok(promo)
    }

    async fn update_promotion_code_coupon(
        &self,
        promotion_code_id: &str,
        coupon_id: &str,
    ) -> ServiceResult<PromotionCode> {
        if self.inner.refuse_rebinding.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamRejection(
                "Received unknown parameter: coupon".into(),
            ));
        }
        if !self.inner.coupons.contains_key(coupon_id) {
            return Err(ServiceError::UpstreamRejection(format!(
                "No such coupon: '{}'",
                coupon_id
            )));
        }
        self.update_code(promotion_code_id, |promo| {
            promo.coupon_id = coupon_id.to_string()
        })
    }

    async fn deactivate_promotion_code(
        &self,
        promotion_code_id: &str,
    ) -> ServiceResult<PromotionCode> {
        self.update_code(promotion_code_id, |promo| promo.active = false)
    }

    async fn delete_promotion_code(&self, promotion_code_id: &str) -> ServiceResult<()> {
        if self.inner.refuse_deletes.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamRejection(
                "Promotion codes cannot be deleted".into(),
            ));
        }
        let redeemed = self
            .inner
            .promotion_codes
            .get(promotion_code_id)
            .map(|promo| promo.times_redeemed);
        match redeemed {
            Some(0) => {
                self.inner.promotion_codes.remove(promotion_code_id);
                Ok(())
            }
            Some(_) => Err(ServiceError::UpstreamRejection(format!(
                "Promotion code '{}' has redemptions",
                promotion_code_id
            ))),
            None => Err(ServiceError::UpstreamRejection(format!(
                "No such promotion code: '{}'",
                promotion_code_id
            ))),
        }
    }

    async fn retrieve_coupon(&self, coupon_id: &str) -> ServiceResult<Option<Coupon>> {
        Ok(self.coupon(coupon_id))
    }

    async fn list_coupons(&self) -> ServiceResult<Vec<Coupon>> {
        let mut coupons: Vec<_> = self
            .inner
            .coupons
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        coupons.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(coupons)
    }

    async fn create_coupon(&self, new_coupon: &NewCoupon) -> ServiceResult<Coupon> {
        if self.inner.coupons.contains_key(&new_coupon.id) {
            return Err(ServiceError::UpstreamRejection(format!(
                "Coupon already exists: '{}'",
                new_coupon.id
            )));
        }
        let coupon = Coupon {
            id: new_coupon.id.clone(),
            amount_off_cents: new_coupon.amount_off_cents,
            currency: new_coupon.currency.clone(),
            max_redemptions: Some(new_coupon.max_redemptions),
            times_redeemed: 0,
            valid: true,
        };
        self.insert_coupon(coupon.clone());
        Ok(coupon)
    }

    async fn delete_coupon(&self, coupon_id: &str) -> ServiceResult<()> {
        if self.inner.refuse_deletes.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamRejection(
                "Coupon deletion refused".into(),
            ));
        }
        match self.inner.coupons.remove(coupon_id) {
            Some(_) => Ok(()),
            None => Err(ServiceError::UpstreamRejection(format!(
                "No such coupon: '{}'",
                coupon_id
            ))),
        }
    }
}
