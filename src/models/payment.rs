use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumString};
use utoipa::ToSchema;

/// Payment status as reported to the browser.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Processing)
    }
}

/// A payment-intent identifier that passed reference validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PaymentIntentId(String);

impl PaymentIntentId {
    /// Only the validator constructs ids from untrusted input.
    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentIntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider view of a payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    /// Raw provider status, e.g. `requires_payment_method`, `processing`, `succeeded`
    pub status: String,
    /// Whether the most recent attempt failed
    #[serde(default)]
    pub last_payment_error: Option<String>,
}

/// What the orchestrator asks the provider to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    /// Canonical promotion code string, forwarded for the provider to judge
    pub promotion_code: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// What the provider returned for a created session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderSession {
    pub id: String,
    pub url: String,
}

/// A hosted checkout session for one purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,
    pub redirect_url: String,
    pub promotion_code: Option<String>,
    #[schema(value_type = String, example = "333.00")]
    pub base_price: Decimal,
    #[schema(value_type = Option<String>, example = "297.00")]
    pub discount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Converts an integer number of cents into a two-decimal amount.
pub fn cents_to_amount(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}
