//! Promotion code consistency.
//!
//! Each advertised code must have exactly one active promotion code bound to
//! the coupon of its price tier, and both entities must carry the tier's
//! redemption ceiling. [`PromotionConsistencyManager::audit_and_repair`]
//! reports every deviation and, when the policy allows, fixes it. A run
//! interrupted halfway leaves entities the next run recognizes as correct.

use crate::config::PricingConfig;
use crate::errors::{ServiceError, ServiceResult};
use crate::models::{canonical_code, DiscountTier, NewCoupon, NewPromotionCode, PromotionCode};
use crate::provider::PaymentProvider;
use metrics::counter;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{info, instrument, warn};

/// How drifted codes are repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RepairStrategy {
    /// Rebind the existing code; recreate when the provider refuses
    InPlace,
    /// Deactivate the drifted code and create a correctly bound one
    Recreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPolicy {
    pub auto_repair: bool,
    pub strategy: RepairStrategy,
    /// Delete zero-redemption leftovers
    pub cleanup_stale: bool,
}

impl RepairPolicy {
    /// Report only.
    pub fn audit_only() -> Self {
        Self {
            auto_repair: false,
            strategy: RepairStrategy::InPlace,
            cleanup_stale: false,
        }
    }

    pub fn repair(strategy: RepairStrategy) -> Self {
        Self {
            auto_repair: true,
            strategy,
            cleanup_stale: true,
        }
    }
}

/// A detected inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    CouponMissing {
        coupon_id: String,
    },
    CouponAmountMismatch {
        coupon_id: String,
        expected_cents: i64,
        actual_cents: i64,
    },
    CouponCeilingMismatch {
        coupon_id: String,
        expected: u32,
        actual: Option<u32>,
    },
    CodeMissing,
    DuplicateActiveCodes {
        promotion_code_ids: Vec<String>,
    },
    Drift {
        promotion_code_id: String,
        bound_coupon_id: String,
        expected_coupon_id: String,
    },
    CodeCeilingMismatch {
        promotion_code_id: String,
        expected: u32,
        actual: Option<u32>,
    },
    CeilingsDisagree {
        promotion_code_id: String,
        coupon_max: Option<u32>,
        code_max: Option<u32>,
    },
}

/// A change made, or one an operator has to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    CreatedCoupon {
        coupon_id: String,
    },
    CreatedCode {
        promotion_code_id: String,
    },
    Rebound {
        promotion_code_id: String,
        coupon_id: String,
    },
    Recreated {
        deactivated_id: String,
        created_id: String,
    },
    Deactivated {
        promotion_code_id: String,
    },
    DeletedPromotionCode {
        promotion_code_id: String,
    },
    DeletedCoupon {
        coupon_id: String,
    },
    ManualActionRequired {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeReport {
    pub code: String,
    pub expected_coupon_id: String,
    pub findings: Vec<Finding>,
    pub actions: Vec<RepairAction>,
}

impl CodeReport {
    pub fn has_drift(&self) -> bool {
        self.findings
            .iter()
            .any(|f| matches!(f, Finding::Drift { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub repaired: bool,
    pub codes: Vec<CodeReport>,
    /// Non-fatal problems, e.g. refused deletions
    pub warnings: Vec<String>,
    pub stale_actions: Vec<RepairAction>,
}

impl RepairReport {
    pub fn has_drift(&self) -> bool {
        self.codes.iter().any(CodeReport::has_drift)
    }

    pub fn drifted_codes(&self) -> Vec<&str> {
        self.codes
            .iter()
            .filter(|c| c.has_drift())
            .map(|c| c.code.as_str())
            .collect()
    }

    /// No findings at all.
    pub fn is_consistent(&self) -> bool {
        self.codes.iter().all(|c| c.findings.is_empty())
    }

    /// Fails with [`ServiceError::DriftDetected`] when any code drifted.
    pub fn ensure_no_drift(&self) -> ServiceResult<()> {
        if self.has_drift() {
            Err(ServiceError::DriftDetected(self.drifted_codes().join(", ")))
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for code in &self.codes {
            let state = if code.findings.is_empty() { "ok" } else { "inconsistent" };
            writeln!(f, "{} -> {}: {}", code.code, code.expected_coupon_id, state)?;
            for finding in &code.findings {
                writeln!(f, "  finding: {:?}", finding)?;
            }
            for action in &code.actions {
                writeln!(f, "  action:  {:?}", action)?;
            }
        }
        for action in &self.stale_actions {
            writeln!(f, "cleanup: {:?}", action)?;
        }
        for warning in &self.warnings {
            writeln!(f, "warning: {}", warning)?;
        }
        Ok(())
    }
}

/// Expected `code -> coupon id` mapping for the configured tiers.
pub fn expected_mappings(pricing: &PricingConfig) -> BTreeMap<String, String> {
    pricing
        .tiers
        .iter()
        .map(|tier| (canonical_code(&tier.code), tier.coupon_id.clone()))
        .collect()
}

/// Keeps provider promotion codes consistent with the configured tiers.
pub struct PromotionConsistencyManager {
    provider: Arc<dyn PaymentProvider>,
    pricing: PricingConfig,
    policy: RepairPolicy,
}

impl PromotionConsistencyManager {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        pricing: PricingConfig,
        policy: RepairPolicy,
    ) -> Self {
        Self {
            provider,
            pricing,
            policy,
        }
    }

    /// Audits every expected mapping and repairs what the policy allows.
    #[instrument(skip(self, expected), fields(codes = expected.len(), repair = self.policy.auto_repair))]
    pub async fn audit_and_repair(
        &self,
        expected: &BTreeMap<String, String>,
    ) -> ServiceResult<RepairReport> {
        let mut report = RepairReport {
            repaired: self.policy.auto_repair,
            codes: Vec::with_capacity(expected.len()),
            warnings: Vec::new(),
            stale_actions: Vec::new(),
        };
        let mut referenced_coupons: HashSet<String> = expected.values().cloned().collect();

        for (code, coupon_id) in expected {
            let code_report = self
                .check_code(
                    &canonical_code(code),
                    coupon_id,
                    &mut report.warnings,
                    &mut referenced_coupons,
                )
                .await?;
            if code_report.has_drift() {
                counter!("enrollment_promotions.drift_detected", 1);
            }
            report.codes.push(code_report);
        }

        if self.policy.auto_repair && self.policy.cleanup_stale {
            self.cleanup_stale_coupons(&referenced_coupons, &mut report)
                .await?;
        }

        info!(
            consistent = report.is_consistent(),
            drift = report.has_drift(),
            warnings = report.warnings.len(),
            "Promotion code audit finished"
        );
        Ok(report)
    }

    async fn check_code(
        &self,
        code: &str,
        expected_coupon_id: &str,
        warnings: &mut Vec<String>,
        referenced_coupons: &mut HashSet<String>,
    ) -> ServiceResult<CodeReport> {
        let mut report = CodeReport {
            code: code.to_string(),
            expected_coupon_id: expected_coupon_id.to_string(),
            findings: Vec::new(),
            actions: Vec::new(),
        };
        let tier = self
            .pricing
            .tier_for_code(code)
            .filter(|tier| tier.coupon_id == expected_coupon_id)
            .cloned();

        let coupon_ready = self
            .check_coupon(expected_coupon_id, tier.as_ref(), &mut report)
            .await?;

        let codes = self.provider.list_promotion_codes(code).await?;
        for promo in &codes {
            if promo.active {
                referenced_coupons.insert(promo.coupon_id.clone());
            }
        }
        let mut active: Vec<PromotionCode> = codes.iter().filter(|p| p.active).cloned().collect();

        if active.is_empty() {
            report.findings.push(Finding::CodeMissing);
            warn!(code, "No active promotion code");
            if self.policy.auto_repair {
                match (&tier, coupon_ready) {
                    (Some(tier), true) => {
                        let created = self.create_code(tier).await?;
                        report.actions.push(RepairAction::CreatedCode {
                            promotion_code_id: created.id,
                        });
                    }
                    _ => report.actions.push(RepairAction::ManualActionRequired {
                        reason: format!("cannot create {} without a known tier and coupon", code),
                    }),
                }
            }
        } else {
            // keep the code bound to the expected coupon, then the most redeemed
            active.sort_by_key(|p| {
                (
                    p.coupon_id != expected_coupon_id,
                    std::cmp::Reverse(p.times_redeemed),
                )
            });
            let keeper = active.remove(0);

            if !active.is_empty() {
                report.findings.push(Finding::DuplicateActiveCodes {
                    promotion_code_ids: active.iter().map(|p| p.id.clone()).collect(),
                });
                if self.policy.auto_repair {
                    for extra in &active {
                        self.provider.deactivate_promotion_code(&extra.id).await?;
                        report.actions.push(RepairAction::Deactivated {
                            promotion_code_id: extra.id.clone(),
                        });
                    }
                }
            }

            if keeper.coupon_id != expected_coupon_id {
                warn!(
                    code,
                    bound = %keeper.coupon_id,
                    expected = expected_coupon_id,
                    "Promotion code drifted to another coupon"
                );
                report.findings.push(Finding::Drift {
                    promotion_code_id: keeper.id.clone(),
                    bound_coupon_id: keeper.coupon_id.clone(),
                    expected_coupon_id: expected_coupon_id.to_string(),
                });
                let survivor = if self.policy.auto_repair && coupon_ready {
                    self.repair_drift(
                        &keeper,
                        expected_coupon_id,
                        tier.as_ref(),
                        &mut report,
                        warnings,
                    )
                    .await?
                } else {
                    if self.policy.auto_repair {
                        report.actions.push(RepairAction::ManualActionRequired {
                            reason: format!(
                                "{} drifted but coupon {} is not usable",
                                code, expected_coupon_id
                            ),
                        });
                    }
                    None
                };
                // the code left active after repair must still carry the tier ceiling
                let checked = survivor.as_ref().unwrap_or(&keeper);
                self.check_code_ceiling(checked, tier.as_ref(), &mut report)
                    .await?;
            } else {
                self.check_code_ceiling(&keeper, tier.as_ref(), &mut report)
                    .await?;
            }
        }

        if self.policy.auto_repair && self.policy.cleanup_stale {
            // re-list so codes deactivated above are included
            let current = self.provider.list_promotion_codes(code).await?;
            for stale in current.iter().filter(|p| !p.active && p.times_redeemed == 0) {
                match self.provider.delete_promotion_code(&stale.id).await {
                    Ok(()) => report.actions.push(RepairAction::DeletedPromotionCode {
                        promotion_code_id: stale.id.clone(),
                    }),
                    Err(e) => warnings.push(format!(
                        "could not delete inactive promotion code {}: {}",
                        stale.id, e
                    )),
                }
            }
        }

        Ok(report)
    }

    /// Returns whether the expected coupon exists and may receive codes.
    async fn check_coupon(
        &self,
        coupon_id: &str,
        tier: Option<&DiscountTier>,
        report: &mut CodeReport,
    ) -> ServiceResult<bool> {
        let Some(coupon) = self.provider.retrieve_coupon(coupon_id).await? else {
            report.findings.push(Finding::CouponMissing {
                coupon_id: coupon_id.to_string(),
            });
            return match (tier, self.policy.auto_repair) {
                (Some(tier), true) => {
                    let created = self
                        .provider
                        .create_coupon(&NewCoupon {
                            id: tier.coupon_id.clone(),
                            amount_off_cents: tier.amount_off_cents,
                            currency: self.pricing.currency.clone(),
                            max_redemptions: tier.max_redemptions,
                            name: format!("{} tier", canonical_code(&tier.code)),
                        })
                        .await?;
                    report.actions.push(RepairAction::CreatedCoupon {
                        coupon_id: created.id,
                    });
                    Ok(true)
                }
                (None, true) => {
                    report.actions.push(RepairAction::ManualActionRequired {
                        reason: format!("coupon {} is missing and no tier describes it", coupon_id),
                    });
                    Ok(false)
                }
                (_, false) => Ok(false),
            };
        };

        let Some(tier) = tier else {
            return Ok(coupon.valid);
        };

        let mut usable = coupon.valid;
        if coupon.amount_off_cents != tier.amount_off_cents {
            usable = false;
            report.findings.push(Finding::CouponAmountMismatch {
                coupon_id: coupon.id.clone(),
                expected_cents: tier.amount_off_cents,
                actual_cents: coupon.amount_off_cents,
            });
            if self.policy.auto_repair {
                report.actions.push(RepairAction::ManualActionRequired {
                    reason: format!(
                        "coupon {} takes {} cents off instead of {}",
                        coupon.id, coupon.amount_off_cents, tier.amount_off_cents
                    ),
                });
            }
        }
        if coupon.max_redemptions != Some(tier.max_redemptions) {
            report.findings.push(Finding::CouponCeilingMismatch {
                coupon_id: coupon.id.clone(),
                expected: tier.max_redemptions,
                actual: coupon.max_redemptions,
            });
        }
        Ok(usable)
    }

    async fn check_code_ceiling(
        &self,
        promo: &PromotionCode,
        tier: Option<&DiscountTier>,
        report: &mut CodeReport,
    ) -> ServiceResult<()> {
        match tier {
            Some(tier) => {
                if promo.max_redemptions != Some(tier.max_redemptions) {
                    report.findings.push(Finding::CodeCeilingMismatch {
                        promotion_code_id: promo.id.clone(),
                        expected: tier.max_redemptions,
                        actual: promo.max_redemptions,
                    });
                }
            }
            None => {
                let coupon_max = self
                    .provider
                    .retrieve_coupon(&promo.coupon_id)
                    .await?
                    .and_then(|c| c.max_redemptions);
                if coupon_max != promo.max_redemptions {
                    report.findings.push(Finding::CeilingsDisagree {
                        promotion_code_id: promo.id.clone(),
                        coupon_max,
                        code_max: promo.max_redemptions,
                    });
                }
            }
        }
        Ok(())
    }

    async fn repair_drift(
        &self,
        drifted: &PromotionCode,
        expected_coupon_id: &str,
        tier: Option<&DiscountTier>,
        report: &mut CodeReport,
        warnings: &mut Vec<String>,
    ) -> ServiceResult<Option<PromotionCode>> {
        if self.policy.strategy == RepairStrategy::InPlace {
            match self
                .provider
                .update_promotion_code_coupon(&drifted.id, expected_coupon_id)
                .await
            {
                Ok(rebound) => {
                    info!(promotion_code_id = %rebound.id, "Promotion code rebound in place");
                    report.actions.push(RepairAction::Rebound {
                        promotion_code_id: rebound.id.clone(),
                        coupon_id: expected_coupon_id.to_string(),
                    });
                    return Ok(Some(rebound));
                }
                Err(e) => {
                    warnings.push(format!(
                        "in-place rebinding of {} refused, recreating: {}",
                        drifted.id, e
                    ));
                }
            }
        }

        let Some(tier) = tier else {
            report.actions.push(RepairAction::ManualActionRequired {
                reason: format!(
                    "{} must be recreated but no tier gives its ceiling",
                    drifted.code
                ),
            });
            return Ok(None);
        };

        self.provider.deactivate_promotion_code(&drifted.id).await?;
        let created = self.create_code(tier).await?;
        info!(
            deactivated = %drifted.id,
            created = %created.id,
            "Promotion code recreated"
        );
        report.actions.push(RepairAction::Recreated {
            deactivated_id: drifted.id.clone(),
            created_id: created.id.clone(),
        });
        Ok(Some(created))
    }

    async fn create_code(&self, tier: &DiscountTier) -> ServiceResult<PromotionCode> {
        self.provider
            .create_promotion_code(&NewPromotionCode {
                code: canonical_code(&tier.code),
                coupon_id: tier.coupon_id.clone(),
                max_redemptions: tier.max_redemptions,
            })
            .await
    }

    /// Deletes unreferenced, never-redeemed coupons that duplicate a tier discount.
    async fn cleanup_stale_coupons(
        &self,
        referenced: &HashSet<String>,
        report: &mut RepairReport,
    ) -> ServiceResult<()> {
        let tier_amounts: HashSet<i64> = self
            .pricing
            .tiers
            .iter()
            .map(|tier| tier.amount_off_cents)
            .collect();

        // codes outside the configured tiers still keep their coupons alive
        let mut referenced = referenced.clone();
        referenced.extend(
            self.provider
                .list_active_promotion_codes()
                .await?
                .into_iter()
                .map(|promo| promo.coupon_id),
        );

        for coupon in self.provider.list_coupons().await? {
            let stale = !referenced.contains(&coupon.id)
                && coupon.times_redeemed == 0
                && tier_amounts.contains(&coupon.amount_off_cents);
            if !stale {
                continue;
            }
            match self.provider.delete_coupon(&coupon.id).await {
                Ok(()) => report.stale_actions.push(RepairAction::DeletedCoupon {
                    coupon_id: coupon.id,
                }),
                Err(e) => report
                    .warnings
                    .push(format!("could not delete stale coupon {}: {}", coupon.id, e)),
            }
        }
        Ok(())
    }
}
