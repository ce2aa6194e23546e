//! Epsilon-greedy distribution over variants from exposure/conversion counts.

use crate::{Counts, Distribution};

/// Exploration share used when the caller does not configure one.
pub const DEFAULT_EPSILON: f64 = 0.2;

/// Conversion rate per variant, in exposure order.
///
/// Variants with no exposures get a rate of 0 rather than NaN/Infinity,
/// so they can never win against a variant that has converted.
pub fn conversion_rates(exposures: &Counts, conversions: &Counts) -> Distribution {
    variant_names(exposures, conversions)
        .map(|name| {
            let seen = exposures.get(name).copied().unwrap_or(0.0);
            let converted = conversions.get(name).copied().unwrap_or(0.0);
            let rate = if seen > 0.0 { converted / seen } else { 0.0 };
            (name.to_string(), rate)
        })
        .collect()
}

/// Winner gets `1 - epsilon`, every other variant `epsilon / (N - 1)`.
///
/// The winner is the strictly greatest rate; ties keep the earlier variant.
/// A lone variant gets probability 1.
pub fn bandit(exposures: &Counts, conversions: &Counts, epsilon: f64) -> Distribution {
    let rates = conversion_rates(exposures, conversions);
    let mut entries = rates.iter();
    let Some(first) = entries.next() else {
        return Distribution::new();
    };
    let (winner, _) = entries.fold(first, |best, candidate| {
        if candidate.1 > best.1 {
            candidate
        } else {
            best
        }
    });

    if rates.len() == 1 {
        return rates.keys().map(|name| (name.clone(), 1.0)).collect();
    }

    let share = epsilon / (rates.len() - 1) as f64;
    rates
        .keys()
        .map(|name| {
            let p = if name == winner { 1.0 - epsilon } else { share };
            (name.clone(), p)
        })
        .collect()
}

/// Names in `exposures` order, followed by any only present in `conversions`.
fn variant_names<'a>(
    exposures: &'a Counts,
    conversions: &'a Counts,
) -> impl Iterator<Item = &'a str> + 'a {
    exposures.keys().map(String::as_str).chain(
        conversions
            .keys()
            .filter(|k| !exposures.contains_key(*k))
            .map(String::as_str),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, f64)]) -> Counts {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_conversion_rates() {
        let rates = conversion_rates(
            &counts(&[("A", 100.0), ("B", 50.0)]),
            &counts(&[("A", 10.0), ("B", 25.0)]),
        );
        assert_eq!(rates["A"], 0.1);
        assert_eq!(rates["B"], 0.5);
    }

    #[test]
    fn test_full_exploration() {
        let dist = bandit(
            &counts(&[("A", 100.0), ("B", 50.0)]),
            &counts(&[("A", 10.0), ("B", 25.0)]),
            1.0,
        );
        assert_eq!(dist["B"], 0.0);
        assert_eq!(dist["A"], 1.0);
    }

    #[test]
    fn test_full_exploitation() {
        let dist = bandit(
            &counts(&[("A", 100.0), ("B", 50.0)]),
            &counts(&[("A", 10.0), ("B", 25.0)]),
            0.0,
        );
        assert_eq!(dist["B"], 1.0);
        assert_eq!(dist["A"], 0.0);
    }

    #[test]
    fn test_default_epsilon_splits_among_losers() {
        let dist = bandit(
            &counts(&[("A", 10.0), ("B", 10.0), ("C", 10.0)]),
            &counts(&[("A", 1.0), ("B", 5.0), ("C", 2.0)]),
            DEFAULT_EPSILON,
        );
        assert!((dist["B"] - 0.8).abs() < 1e-12);
        assert!((dist["A"] - 0.1).abs() < 1e-12);
        assert!((dist["C"] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_ties_keep_first_variant() {
        let dist = bandit(
            &counts(&[("A", 10.0), ("B", 10.0)]),
            &counts(&[("A", 2.0), ("B", 2.0)]),
            0.2,
        );
        assert!((dist["A"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_zero_exposures_never_win() {
        let dist = bandit(
            &counts(&[("A", 0.0), ("B", 10.0)]),
            &counts(&[("A", 3.0), ("B", 1.0)]),
            0.2,
        );
        assert!((dist["B"] - 0.8).abs() < 1e-12);
        assert!(dist.values().all(|p| p.is_finite()));
    }

    #[test]
    fn test_single_variant_gets_everything() {
        let dist = bandit(&counts(&[("A", 10.0)]), &counts(&[("A", 1.0)]), 0.2);
        assert_eq!(dist["A"], 1.0);
        assert!(bandit(&Counts::new(), &Counts::new(), 0.2).is_empty());
    }
}
