//! Normalisation of declared variant weights and weighted selection.

use crate::Distribution;
use rand::Rng;
use variant_core::types::{Experiment, Variant};

/// Decimal places kept after balancing; sums may land at 0.9999.
pub const PROBABILITY_PRECISION: i32 = 4;

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Balanced weights aligned with `variants`.
///
/// Missing, NaN or negative weights count as 0. When every weight is 0 the
/// variants are weighted equally.
pub fn balanced_weights(variants: &[Variant]) -> Vec<f64> {
    if variants.is_empty() {
        return Vec::new();
    }
    let weights: Vec<f64> = variants
        .iter()
        .map(|v| match v.probability {
            Some(p) if p.is_finite() && p > 0.0 => p,
            _ => 0.0,
        })
        .collect();
    let sum: f64 = weights.iter().sum();

    if sum <= 0.0 {
        let equal = round_to(1.0 / variants.len() as f64, PROBABILITY_PRECISION);
        return vec![equal; variants.len()];
    }
    let scale = 1.0 / sum;
    weights
        .into_iter()
        .map(|w| round_to(w * scale, PROBABILITY_PRECISION))
        .collect()
}

/// Balanced distribution keyed by variant name; duplicate names keep the first.
pub fn balance_probabilities(variants: &[Variant]) -> Distribution {
    let mut distribution = Distribution::new();
    for (variant, p) in variants.iter().zip(balanced_weights(variants)) {
        distribution.entry(variant.name.clone()).or_insert(p);
    }
    distribution
}

/// Draws a variant using the balanced weights of the experiment.
///
/// Entries are walked in ascending probability; the first whose running sum
/// reaches the draw wins. Rounding can leave the total just under 1, in which
/// case the most probable variant absorbs the remainder.
pub fn select_with_probabilities<'a, R: Rng + ?Sized>(
    experiment: &'a Experiment,
    rng: &mut R,
) -> Option<&'a Variant> {
    let weights = balanced_weights(&experiment.variants);
    let mut order: Vec<(usize, f64)> = weights.into_iter().enumerate().collect();
    order.sort_by(|a, b| a.1.total_cmp(&b.1));

    let draw: f64 = rng.gen();
    let mut cumulative = 0.0;
    for &(idx, p) in &order {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        if cumulative >= draw {
            return experiment.variants.get(idx);
        }
    }
    order.last().and_then(|&(idx, _)| experiment.variants.get(idx))
}
