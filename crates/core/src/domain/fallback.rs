use crate::domain::snapshot::TickerRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-record switch deciding whether fallback rules may touch the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    #[default]
    Disabled,
    EstimateForActual,
}

impl FallbackPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Some(FallbackPolicy::Disabled),
            "estimate_for_actual" | "estimate-for-actual" => {
                Some(FallbackPolicy::EstimateForActual)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackRule {
    EpsEstimateForActual,
    RevenueEstimateForActual,
}

/// Rules in application order.
pub const RULES: [FallbackRule; 2] = [
    FallbackRule::EpsEstimateForActual,
    FallbackRule::RevenueEstimateForActual,
];

impl FallbackRule {
    fn apply(self, record: &mut TickerRecord) -> bool {
        match self {
            FallbackRule::EpsEstimateForActual => {
                if record.eps_actual.is_none() && record.eps_estimate.is_some() {
                    record.eps_actual = record.eps_estimate;
                    return true;
                }
                false
            }
            FallbackRule::RevenueEstimateForActual => {
                if record.revenue_actual.is_none() && record.revenue_estimate.is_some() {
                    record.revenue_actual = record.revenue_estimate;
                    return true;
                }
                false
            }
        }
    }
}

/// Applies every rule once, in order, when the record's policy allows it.
///
/// Callers must reset the EPS/revenue group (including `applied_fallbacks`) from fresh
/// upstream data before calling, otherwise a previously substituted actual would look real.
pub fn apply_rules(record: &mut TickerRecord) -> BTreeSet<FallbackRule> {
    let mut applied = BTreeSet::new();
    if record.fallback_policy != FallbackPolicy::EstimateForActual {
        return applied;
    }

    for rule in RULES {
        if rule.apply(record) {
            applied.insert(rule);
        }
    }

    record.applied_fallbacks.extend(applied.iter().copied());
    applied
}
