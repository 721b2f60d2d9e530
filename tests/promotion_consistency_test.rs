use std::sync::Arc;

use assert_matches::assert_matches;
use enrollment_api::{
    config::PricingConfig,
    errors::ServiceError,
    models::{Coupon, PromotionCode},
    provider::InMemoryPaymentProvider,
    services::promotions::{
        expected_mappings, Finding, PromotionConsistencyManager, RepairAction, RepairPolicy,
        RepairStrategy,
    },
};
use test_case::test_case;

/// EARLY36 bound to the wrong coupon, SAVE70 missing entirely.
fn damaged_provider(pricing: &PricingConfig) -> InMemoryPaymentProvider {
    let provider = InMemoryPaymentProvider::new();
    for tier in &pricing.tiers {
        provider.insert_coupon(Coupon {
            id: tier.coupon_id.clone(),
            amount_off_cents: tier.amount_off_cents,
            currency: pricing.currency.clone(),
            max_redemptions: Some(tier.max_redemptions),
            times_redeemed: 0,
            valid: true,
        });
    }
    provider.insert_coupon(Coupon {
        id: "coupon_legacy".into(),
        amount_off_cents: 10_000,
        currency: pricing.currency.clone(),
        max_redemptions: Some(100),
        times_redeemed: 0,
        valid: true,
    });
    provider.insert_promotion_code(PromotionCode {
        id: "promo_drifted".into(),
        code: "early36".into(),
        coupon_id: "coupon_legacy".into(),
        max_redemptions: Some(100),
        times_redeemed: 0,
        active: true,
    });
    provider
}

fn manager(
    provider: &InMemoryPaymentProvider,
    pricing: &PricingConfig,
    policy: RepairPolicy,
) -> PromotionConsistencyManager {
    PromotionConsistencyManager::new(Arc::new(provider.clone()), pricing.clone(), policy)
}

fn active_bindings(provider: &InMemoryPaymentProvider, code: &str) -> Vec<String> {
    provider
        .promotion_codes()
        .into_iter()
        .filter(|p| p.active && p.matches(code))
        .map(|p| p.coupon_id)
        .collect()
}

#[tokio::test]
async fn audit_flags_drift_and_leaves_provider_untouched() {
    let pricing = PricingConfig::default();
    let provider = damaged_provider(&pricing);
    let before = provider.promotion_codes();

    let report = manager(&provider, &pricing, RepairPolicy::audit_only())
        .audit_and_repair(&expected_mappings(&pricing))
        .await
        .unwrap();

    assert!(!report.repaired);
    assert_eq!(report.drifted_codes(), vec!["EARLY36"]);
    assert!(!report.is_consistent());
    assert_matches!(
        report.ensure_no_drift(),
        Err(ServiceError::DriftDetected(codes)) if codes == "EARLY36"
    );
    assert_eq!(provider.promotion_codes(), before);
}

#[test_case(RepairStrategy::InPlace ; "in place")]
#[test_case(RepairStrategy::Recreate ; "recreate")]
#[tokio::test]
async fn repair_converges_within_two_runs(strategy: RepairStrategy) {
    let pricing = PricingConfig::default();
    let provider = damaged_provider(&pricing);
    let expected = expected_mappings(&pricing);

    let first = manager(&provider, &pricing, RepairPolicy::repair(strategy))
        .audit_and_repair(&expected)
        .await
        .unwrap();
    assert!(first.repaired);
    assert!(first.has_drift());

    let second = manager(&provider, &pricing, RepairPolicy::audit_only())
        .audit_and_repair(&expected)
        .await
        .unwrap();
    assert!(second.is_consistent(), "{}", second);
    second.ensure_no_drift().unwrap();

    assert_eq!(active_bindings(&provider, "EARLY36"), vec!["coupon_early36"]);
    assert_eq!(active_bindings(&provider, "SAVE70"), vec!["coupon_save70"]);
}

#[tokio::test]
async fn recreate_cleans_up_the_deactivated_code() {
    let pricing = PricingConfig::default();
    let provider = damaged_provider(&pricing);

    let report = manager(
        &provider,
        &pricing,
        RepairPolicy::repair(RepairStrategy::Recreate),
    )
    .audit_and_repair(&expected_mappings(&pricing))
    .await
    .unwrap();

    let early = report.codes.iter().find(|c| c.code == "EARLY36").unwrap();
    assert!(early.actions.iter().any(|a| matches!(
        a,
        RepairAction::Recreated { deactivated_id, .. } if deactivated_id == "promo_drifted"
    )));
    assert!(early.actions.contains(&RepairAction::DeletedPromotionCode {
        promotion_code_id: "promo_drifted".into()
    }));
    assert!(provider
        .promotion_codes()
        .iter()
        .all(|p| p.id != "promo_drifted"));
}

#[tokio::test]
async fn report_serializes_for_operators() {
    let pricing = PricingConfig::default();
    let provider = damaged_provider(&pricing);

    let report = manager(&provider, &pricing, RepairPolicy::audit_only())
        .audit_and_repair(&expected_mappings(&pricing))
        .await
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();

    let early = json["codes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["code"] == "EARLY36")
        .unwrap();
    assert_eq!(early["findings"][0]["kind"], "drift");
    assert_eq!(early["findings"][0]["bound_coupon_id"], "coupon_legacy");

    let rendered = report.to_string();
    assert!(rendered.contains("EARLY36 -> coupon_early36: inconsistent"));
    assert!(rendered.contains("SAVE70 -> coupon_save70: inconsistent"));
}

#[tokio::test]
async fn rebound_code_is_still_checked_against_the_tier_ceiling() {
    let pricing = PricingConfig::default();
    let provider = damaged_provider(&pricing);
    let mut drifted = provider
        .promotion_codes()
        .into_iter()
        .find(|p| p.id == "promo_drifted")
        .unwrap();
    drifted.max_redemptions = Some(50);
    provider.insert_promotion_code(drifted);

    let report = manager(
        &provider,
        &pricing,
        RepairPolicy::repair(RepairStrategy::InPlace),
    )
    .audit_and_repair(&expected_mappings(&pricing))
    .await
    .unwrap();

    let early = report.codes.iter().find(|c| c.code == "EARLY36").unwrap();
    assert!(matches!(early.findings[0], Finding::Drift { .. }));
    assert!(early.findings.contains(&Finding::CodeCeilingMismatch {
        promotion_code_id: "promo_drifted".into(),
        expected: 100,
        actual: Some(50),
    }));
    assert!(early.actions.contains(&RepairAction::Rebound {
        promotion_code_id: "promo_drifted".into(),
        coupon_id: "coupon_early36".into(),
    }));

    let after = manager(&provider, &pricing, RepairPolicy::audit_only())
        .audit_and_repair(&expected_mappings(&pricing))
        .await
        .unwrap();
    assert!(!after.has_drift());
    assert!(!after.is_consistent());
}

#[tokio::test]
async fn coupons_behind_codes_outside_the_tiers_survive_cleanup() {
    let pricing = PricingConfig::default();
    let provider = InMemoryPaymentProvider::seeded(&pricing.tiers, &pricing.currency);
    provider.insert_coupon(Coupon {
        id: "coupon_vip".into(),
        amount_off_cents: 29_700,
        currency: pricing.currency.clone(),
        max_redemptions: Some(10),
        times_redeemed: 0,
        valid: true,
    });
    provider.insert_promotion_code(PromotionCode {
        id: "promo_vip".into(),
        code: "VIP".into(),
        coupon_id: "coupon_vip".into(),
        max_redemptions: Some(10),
        times_redeemed: 0,
        active: true,
    });
    provider.insert_coupon(Coupon {
        id: "coupon_orphan".into(),
        amount_off_cents: 29_700,
        currency: pricing.currency.clone(),
        max_redemptions: Some(100),
        times_redeemed: 0,
        valid: true,
    });

    let report = manager(
        &provider,
        &pricing,
        RepairPolicy::repair(RepairStrategy::InPlace),
    )
    .audit_and_repair(&expected_mappings(&pricing))
    .await
    .unwrap();

    assert_eq!(
        report.stale_actions,
        vec![RepairAction::DeletedCoupon {
            coupon_id: "coupon_orphan".into()
        }]
    );
    assert!(provider.coupon("coupon_vip").is_some());
    assert_eq!(active_bindings(&provider, "VIP"), vec!["coupon_vip"]);
}
