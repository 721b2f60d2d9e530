use serde::{Deserialize, Serialize};

/// Canonical form of a human-entered promotion code: trimmed and upper-cased.
pub fn canonical_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// A provider discount definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: String,
    pub amount_off_cents: i64,
    pub currency: String,
    pub max_redemptions: Option<u32>,
    pub times_redeemed: u32,
    pub valid: bool,
}

/// A human-facing code string bound to one coupon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionCode {
    pub id: String,
    pub code: String,
    pub coupon_id: String,
    pub max_redemptions: Option<u32>,
    pub times_redeemed: u32,
    pub active: bool,
}

impl PromotionCode {
    pub fn matches(&self, code: &str) -> bool {
        canonical_code(&self.code) == canonical_code(code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCoupon {
    /// Explicit id so the coupon matches its tier mapping
    pub id: String,
    pub amount_off_cents: i64,
    pub currency: String,
    pub max_redemptions: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPromotionCode {
    pub code: String,
    pub coupon_id: String,
    pub max_redemptions: u32,
}

/// One advertised price point: the code visitors type, the coupon it must be
/// bound to, the discount that coupon must carry and the shared redemption
/// ceiling for both entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountTier {
    pub code: String,
    pub coupon_id: String,
    pub amount_off_cents: i64,
    pub max_redemptions: u32,
}

impl DiscountTier {
    pub fn final_charge_cents(&self, base_price_cents: i64) -> i64 {
        base_price_cents - self.amount_off_cents
    }
}
