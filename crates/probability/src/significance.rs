//! Chi-square test of independence between variant and conversion.

use crate::Counts;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

/// P-value of the 2xN (converted, not converted) contingency table.
///
/// Returns `None` whenever a valid table cannot be formed: no variants,
/// a variant with zero exposures, more conversions than exposures, or an
/// outcome column that is empty across every variant.
pub fn p_value(exposures: &Counts, conversions: &Counts) -> Option<f64> {
    if exposures.len() < 2 {
        return None;
    }

    let mut rows = Vec::with_capacity(exposures.len());
    for (name, &seen) in exposures {
        let converted = conversions.get(name).copied().unwrap_or(0.0);
        if !(seen > 0.0) || converted < 0.0 || converted > seen {
            debug!(variant = %name, seen, converted, "Cannot build contingency table");
            return None;
        }
        rows.push((converted, seen - converted));
    }

    let total: f64 = rows.iter().map(|(s, f)| s + f).sum();
    let successes: f64 = rows.iter().map(|(s, _)| s).sum();
    let failures = total - successes;
    if successes <= 0.0 || failures <= 0.0 {
        return None;
    }

    let statistic: f64 = rows
        .iter()
        .map(|&(s, f)| {
            let row_total = s + f;
            let expected_s = row_total * successes / total;
            let expected_f = row_total * failures / total;
            (s - expected_s).powi(2) / expected_s + (f - expected_f).powi(2) / expected_f
        })
        .sum();

    let df = (rows.len() - 1) as f64;
    let distribution = match ChiSquared::new(df) {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "Invalid chi-square distribution");
            return None;
        }
    };
    let p = 1.0 - distribution.cdf(statistic);
    p.is_finite().then_some(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, f64)]) -> Counts {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_matches_reference_value() {
        let p = p_value(
            &counts(&[("A", 30.0), ("B", 70.0)]),
            &counts(&[("A", 20.0), ("B", 40.0)]),
        )
        .unwrap();
        assert_eq!((p * 1000.0).round() / 1000.0, 0.373);
    }

    #[test]
    fn test_degenerate_tables() {
        assert_eq!(p_value(&Counts::new(), &Counts::new()), None);
        assert_eq!(p_value(&counts(&[("A", 0.0)]), &counts(&[("A", 0.0)])), None);
        assert_eq!(
            p_value(
                &counts(&[("A", 0.0), ("B", 10.0)]),
                &counts(&[("A", 0.0), ("B", 1.0)])
            ),
            None
        );
        assert_eq!(
            p_value(
                &counts(&[("A", 10.0), ("B", 10.0)]),
                &counts(&[("A", 0.0), ("B", 0.0)])
            ),
            None
        );
    }

    #[test]
    fn test_identical_rates_are_not_significant() {
        let p = p_value(
            &counts(&[("A", 100.0), ("B", 100.0)]),
            &counts(&[("A", 10.0), ("B", 10.0)]),
        )
        .unwrap();
        assert!((p - 1.0).abs() < 1e-9);
    }
}
