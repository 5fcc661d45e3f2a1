//! Weighted combination of factor scores.
//!
//! Absent factors drop out and their weight is spread proportionally over
//! the factors that are present, so the weights actually applied always sum
//! to one.

use pulse_core::{RiskLevel, RiskThresholds};
use std::collections::BTreeMap;

/// Result of combining present factor values.
#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    /// Weighted mean in [0, 1] before rounding.
    pub raw: f64,
    /// `round(raw × 100)` clamped to [0, 100].
    pub overall: i32,
    pub risk_level: RiskLevel,
    /// Renormalized weight applied to each present factor.
    pub effective_weights: BTreeMap<String, f64>,
}

/// Combine `values` (present factors only) under `weights`.
///
/// Factors without a positive weight are ignored. Returns `None` when no
/// weighted factor is present.
pub fn combine(
    values: &BTreeMap<String, f64>,
    weights: &BTreeMap<String, f64>,
    thresholds: &RiskThresholds,
) -> Option<Combined> {
    let present: Vec<(&String, f64, f64)> = values
        .iter()
        .filter_map(|(name, value)| {
            let weight = *weights.get(name)?;
            (weight > 0.0 && value.is_finite()).then(|| (name, value.clamp(0.0, 1.0), weight))
        })
        .collect();

    let denominator: f64 = present.iter().map(|(_, _, w)| w).sum();
    if present.is_empty() || denominator <= 0.0 {
        return None;
    }

    let effective_weights: BTreeMap<String, f64> = present
        .iter()
        .map(|(name, _, w)| ((*name).clone(), w / denominator))
        .collect();
    let raw: f64 = present
        .iter()
        .map(|(_, value, w)| value * (w / denominator))
        .sum();
    let overall = ((raw * 100.0).round() as i32).clamp(0, 100);

    Some(Combined {
        raw,
        overall,
        risk_level: thresholds.band(overall),
        effective_weights,
    })
}
