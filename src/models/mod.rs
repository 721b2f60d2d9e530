pub mod lead;
pub mod payment;
pub mod promotion;

pub use lead::{Lead, LeadRecord, LeadSubmission, Referral, StorageDriver};
pub use payment::{
    cents_to_amount, CheckoutRequest, CheckoutSession, PaymentIntent, PaymentIntentId,
    PaymentStatus, ProviderSession,
};
pub use promotion::{
    canonical_code, Coupon, DiscountTier, NewCoupon, NewPromotionCode, PromotionCode,
};
