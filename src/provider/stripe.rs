use super::PaymentProvider;
use crate::config::PaymentConfig;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{
    canonical_code, CheckoutRequest, Coupon, NewCoupon, NewPromotionCode, PaymentIntent,
    PaymentIntentId, PromotionCode, ProviderSession,
};
use async_trait::async_trait;
use metrics::counter;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// REST client for a Stripe-compatible payment provider.
///
/// Requests are form-encoded and authenticated with the secret key as a
/// bearer token. Every call is bounded by the configured request timeout.
#[derive(Clone)]
pub struct StripeProvider {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

/// List items that can serve as a `starting_after` cursor.
trait Listed {
    fn cursor(&self) -> &str;
}

const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct WireCoupon {
    id: String,
    #[serde(default)]
    amount_off: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    max_redemptions: Option<u32>,
    #[serde(default)]
    times_redeemed: u32,
    #[serde(default)]
    valid: bool,
}

impl Listed for WireCoupon {
    fn cursor(&self) -> &str {
        &self.id
    }
}

impl From<WireCoupon> for Coupon {
    fn from(wire: WireCoupon) -> Self {
        Coupon {
            id: wire.id,
            amount_off_cents: wire.amount_off.unwrap_or_default(),
            currency: wire.currency.unwrap_or_default(),
            max_redemptions: wire.max_redemptions,
            times_redeemed: wire.times_redeemed,
            valid: wire.valid,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePromotionCode {
    id: String,
    code: String,
    coupon: WireCoupon,
    #[serde(default)]
    max_redemptions: Option<u32>,
    #[serde(default)]
    times_redeemed: u32,
    active: bool,
}

impl Listed for WirePromotionCode {
    fn cursor(&self) -> &str {
        &self.id
    }
}

impl From<WirePromotionCode> for PromotionCode {
    fn from(wire: WirePromotionCode) -> Self {
        PromotionCode {
            id: wire.id,
            code: wire.code,
            coupon_id: wire.coupon.id,
            max_redemptions: wire.max_redemptions,
            times_redeemed: wire.times_redeemed,
            active: wire.active,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WirePaymentError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    last_payment_error: Option<WirePaymentError>,
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl StripeProvider {
    pub fn new(config: &PaymentConfig) -> ServiceResult<Self> {
        let secret_key = config
            .secret_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::Configuration("payment.secret_key is not set".to_string())
            })?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ServiceError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            secret_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> ServiceResult<T> {
        match self.call_optional(method, path, form).await? {
            Some(value) => Ok(value),
            None => Err(ServiceError::UpstreamRejection(format!(
                "{} returned 404",
                path
            ))),
        }
    }

    /// Like [`Self::call`] but a 404 yields `Ok(None)`.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> ServiceResult<Option<T>> {
        let mut request = self
            .client
            .request(method.clone(), self.url(path))
            .bearer_auth(&self.secret_key);
        if let Some(fields) = form {
            request = request.form(fields);
        }

        debug!(%method, path, "Calling payment provider");

        let response = request.send().await.map_err(|e| {
            counter!("enrollment_provider.transport_errors", 1);
            classify_transport_error(path, e)
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response.text().await.map_err(|e| classify_transport_error(path, e))?;

        if !status.is_success() {
            counter!("enrollment_provider.error_responses", 1);
            return Err(classify_error_response(path, status, &body));
        }

        serde_json::from_str(&body).map(Some).map_err(|e| {
            ServiceError::UpstreamUnavailable(format!(
                "unreadable response from {}: {}",
                path, e
            ))
        })
    }

    /// Collects every page of a list endpoint, following `starting_after`
    /// until the provider reports no more entries.
    async fn list_all<T: DeserializeOwned + Listed>(&self, path: &str) -> ServiceResult<Vec<T>> {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page_path = match &cursor {
                Some(after) => format!(
                    "{}{}limit={}&starting_after={}",
                    path, separator, PAGE_SIZE, after
                ),
                None => format!("{}{}limit={}", path, separator, PAGE_SIZE),
            };
            let page: ListResponse<T> = self.call(Method::GET, &page_path, None).await?;
            let last = page.data.last().map(|item| item.cursor().to_string());
            items.extend(page.data);

            match last {
                Some(last) if page.has_more => cursor = Some(last),
                _ => break,
            }
        }

        debug!(path, count = items.len(), "Listed provider entities");
        Ok(items)
    }

    async fn active_promotion_code_id(&self, code: &str) -> ServiceResult<String> {
        self.list_promotion_codes(code)
            .await?
            .into_iter()
            .find(|promo| promo.active && promo.matches(code))
            .map(|promo| promo.id)
            .ok_or_else(|| {
                ServiceError::UpstreamRejection(format!(
                    "no active promotion code matches '{}'",
                    code
                ))
            })
    }
}

fn classify_transport_error(path: &str, err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::UpstreamTimeout(format!("{} timed out", path))
    } else {
        ServiceError::UpstreamUnavailable(format!("{}: {}", path, err))
    }
}

fn classify_error_response(path: &str, status: StatusCode, body: &str) -> ServiceError {
    let detail = serde_json::from_str::<WireErrorEnvelope>(body)
        .ok()
        .map(|envelope| {
            let kind = envelope.error.kind.unwrap_or_else(|| "error".to_string());
            match envelope.error.message {
                Some(message) => format!("{}: {}", kind, message),
                None => kind,
            }
        })
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    warn!(path, status = status.as_u16(), %detail, "Payment provider returned an error");

    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ServiceError::UpstreamTimeout(detail)
    } else if status.is_client_error() {
        ServiceError::UpstreamRejection(detail)
    } else {
        ServiceError::UpstreamUnavailable(detail)
    }
}

fn field(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    #[instrument(skip(self, request), fields(price = %request.price_id))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ServiceResult<ProviderSession> {
        let mut form = vec![
            field("mode", "payment"),
            field("line_items[0][price]", &request.price_id),
            field("line_items[0][quantity]", 1),
            field("success_url", &request.success_url),
            field("cancel_url", &request.cancel_url),
        ];
        if let Some(email) = &request.customer_email {
            form.push(field("customer_email", email));
        }
        for (key, value) in &request.metadata {
            form.push(field(&format!("metadata[{}]", key), value));
        }
        match &request.promotion_code {
            Some(code) => {
                let promo_id = self.active_promotion_code_id(code).await?;
                form.push(field("discounts[0][promotion_code]", promo_id));
            }
            None => form.push(field("allow_promotion_codes", true)),
        }

        self.call(Method::POST, "/v1/checkout/sessions", Some(form.as_slice()))
            .await
    }

    async fn retrieve_payment_intent(&self, id: &PaymentIntentId) -> ServiceResult<PaymentIntent> {
        let path = format!("/v1/payment_intents/{}", id);
        let wire: WirePaymentIntent = self
            .call_optional(Method::GET, &path, None)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment intent {}", id)))?;

        Ok(PaymentIntent {
            id: wire.id,
            status: wire.status,
            last_payment_error: wire
                .last_payment_error
                .map(|e| e.message.or(e.code).unwrap_or_else(|| "payment failed".into())),
        })
    }

    async fn list_promotion_codes(&self, code: &str) -> ServiceResult<Vec<PromotionCode>> {
        let path = format!(
            "/v1/promotion_codes?code={}",
            url::form_urlencoded::byte_serialize(canonical_code(code).as_bytes())
                .collect::<String>()
        );
        let codes: Vec<WirePromotionCode> = self.list_all(&path).await?;
        Ok(codes.into_iter().map(PromotionCode::from).collect())
    }

    async fn list_active_promotion_codes(&self) -> ServiceResult<Vec<PromotionCode>> {
        let codes: Vec<WirePromotionCode> =
            self.list_all("/v1/promotion_codes?active=true").await?;
        Ok(codes.into_iter().map(PromotionCode::from).collect())
    }

    async fn create_promotion_code(
        &self,
        new_code: &NewPromotionCode,
    ) -> ServiceResult<PromotionCode> {
        let form = vec![
            field("coupon", &new_code.coupon_id),
            field("code", &new_code.code),
            field("max_redemptions", new_code.max_redemptions),
        ];
        let wire: WirePromotionCode = self
            .call(Method::POST, "/v1/promotion_codes", Some(form.as_slice()))
            .await?;
        Ok(wire.into())
    }

    async fn update_promotion_code_coupon(
        &self,
        promotion_code_id: &str,
        coupon_id: &str,
    ) -> ServiceResult<PromotionCode> {
        let path = format!("/v1/promotion_codes/{}", promotion_code_id);
        let form = vec![field("coupon", coupon_id)];
        let wire: WirePromotionCode = self.call(Method::POST, &path, Some(form.as_slice())).await?;
        Ok(wire.into())
    }

    async fn deactivate_promotion_code(
        &self,
        promotion_code_id: &str,
    ) -> ServiceResult<PromotionCode> {
        let path = format!("/v1/promotion_codes/{}", promotion_code_id);
        let form = vec![field("active", false)];
        let wire: WirePromotionCode = self.call(Method::POST, &path, Some(form.as_slice())).await?;
        Ok(wire.into())
    }

    async fn delete_promotion_code(&self, promotion_code_id: &str) -> ServiceResult<()> {
        let path = format!("/v1/promotion_codes/{}", promotion_code_id);
        let _: serde_json::Value = self.call(Method::DELETE, &path, None).await?;
        Ok(())
    }

    async fn retrieve_coupon(&self, coupon_id: &str) -> ServiceResult<Option<Coupon>> {
        let path = format!("/v1/coupons/{}", coupon_id);
        let wire: Option<WireCoupon> = self.call_optional(Method::GET, &path, None).await?;
        Ok(wire.map(Coupon::from))
    }

    async fn list_coupons(&self) -> ServiceResult<Vec<Coupon>> {
        let coupons: Vec<WireCoupon> = self.list_all("/v1/coupons").await?;
        Ok(coupons.into_iter().map(Coupon::from).collect())
    }

    async fn create_coupon(&self, new_coupon: &NewCoupon) -> ServiceResult<Coupon> {
        let form = vec![
            field("id", &new_coupon.id),
            field("amount_off", new_coupon.amount_off_cents),
            field("currency", &new_coupon.currency),
            field("duration", "once"),
            field("max_redemptions", new_coupon.max_redemptions),
            field("name", &new_coupon.name),
        ];
        let wire: WireCoupon = self.call(Method::POST, "/v1/coupons", Some(form.as_slice())).await?;
        Ok(wire.into())
    }

    async fn delete_coupon(&self, coupon_id: &str) -> ServiceResult<()> {
        let path = format!("/v1/coupons/{}", coupon_id);
        let _: serde_json::Value = self.call(Method::DELETE, &path, None).await?;
        Ok(())
    }
}
