//! Lead and payment-reference validation.
//!
//! Validation is pure: raw visitor input goes in, either a sanitized
//! [`Lead`] or a [`ValidationFailure`] listing every offending field comes
//! out. Nothing here touches storage or the payment provider.

use crate::config::TestEmailRule;
use crate::errors::{FieldError, ValidationFailure};
use crate::middleware_helpers::sanitize::{normalize_email, sanitize_field};
use crate::models::{Lead, LeadSubmission, PaymentIntentId, Referral};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use validator::Validate;

pub const REQUIRED_FIELDS_MESSAGE: &str = "required fields missing";

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").expect("valid email regex")
});
static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9+\-\s()]{10,20}$").expect("valid phone regex"));
static PAYMENT_INTENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^pi_[A-Za-z0-9]{24,}$").expect("valid payment intent regex"));

/// Sanitized values awaiting the field rules.
#[derive(Debug, Validate)]
struct LeadCandidate {
    #[validate(length(min = 2, max = 100, message = "name must be 2-100 characters"))]
    name: String,
    #[validate(
        length(max = 255, message = "email must be at most 255 characters"),
        regex(path = "EMAIL_PATTERN", message = "email must look like name@domain.tld")
    )]
    email: String,
    #[validate(regex(
        path = "PHONE_PATTERN",
        message = "phone must be 10-20 characters of digits, spaces, + - ( )"
    ))]
    phone: String,
}

/// Validate and sanitize a lead submission.
///
/// Missing or blank `name`, `email` or `phone` short-circuits with
/// [`REQUIRED_FIELDS_MESSAGE`] and one error per missing field. Otherwise
/// every field rule runs and all violations are reported together.
pub fn validate_lead(
    raw: &LeadSubmission,
    email_rule: &TestEmailRule,
) -> Result<Lead, ValidationFailure> {
    let missing: Vec<FieldError> = [
        ("name", &raw.name),
        ("email", &raw.email),
        ("phone", &raw.phone),
    ]
    .into_iter()
    .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
    .map(|(field, _)| FieldError::new(field, format!("{} is required", field)))
    .collect();

    if !missing.is_empty() {
        return Err(ValidationFailure::new(REQUIRED_FIELDS_MESSAGE, missing));
    }

    let candidate = LeadCandidate {
        name: sanitize_field(raw.name.as_deref().unwrap_or_default()),
        email: normalize_email(raw.email.as_deref().unwrap_or_default()),
        phone: sanitize_field(raw.phone.as_deref().unwrap_or_default()),
    };

    let mut errors = match candidate.validate() {
        Ok(()) => Vec::new(),
        Err(errs) => ValidationFailure::from(errs).errors,
    };

    if !errors.iter().any(|e| e.field == "email") {
        if let Some(err) = check_test_email(&candidate.email, email_rule) {
            errors.push(err);
        }
    }

    if !errors.is_empty() {
        errors.sort_by(|a, b| a.field.cmp(&b.field));
        return Err(ValidationFailure::new("Validation failed", errors));
    }

    Ok(Lead {
        name: candidate.name,
        email: candidate.email,
        phone: candidate.phone,
        referral: Referral {
            referrer: optional_field(&raw.referrer),
            utm_source: optional_field(&raw.utm_source),
            utm_campaign: optional_field(&raw.utm_campaign),
        },
        created_at: Utc::now(),
    })
}

/// Normalize and check a standalone email address, e.g. for guest checkout.
pub fn validate_email(raw: &str) -> Result<String, ValidationFailure> {
    let email = normalize_email(raw);
    if email.is_empty() {
        return Err(ValidationFailure::single("email", "email is required"));
    }
    if email.chars().count() > 255 || !EMAIL_PATTERN.is_match(&email) {
        return Err(ValidationFailure::single(
            "email",
            "email must look like name@domain.tld",
        ));
    }
    Ok(email)
}

/// Accepts only provider payment-intent ids: `pi_` plus at least 24 ASCII alphanumerics.
pub fn validate_payment_reference(raw: &str) -> Result<PaymentIntentId, ValidationFailure> {
    if raw.is_empty() {
        return Err(ValidationFailure::single(
            "paymentIntentId",
            "paymentIntentId is required",
        ));
    }
    if !PAYMENT_INTENT_PATTERN.is_match(raw) {
        return Err(ValidationFailure::single(
            "paymentIntentId",
            "paymentIntentId is not a valid payment reference",
        ));
    }
    Ok(PaymentIntentId::new_unchecked(raw.to_string()))
}

fn check_test_email(email: &str, rule: &TestEmailRule) -> Option<FieldError> {
    match rule {
        TestEmailRule::Allow => None,
        TestEmailRule::RejectDomains { domains } => {
            let domain = email.rsplit_once('@').map(|(_, d)| d)?;
            domains
                .iter()
                .any(|blocked| blocked.trim().eq_ignore_ascii_case(domain))
                .then(|| FieldError::new("email", "email domain is not accepted"))
        }
    }
}

fn optional_field(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(sanitize_field)
        .filter(|v| !v.is_empty())
}
