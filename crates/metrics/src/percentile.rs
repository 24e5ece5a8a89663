//! Exact percentile computation and sample-size-adaptive percentile sets.

/// Percentiles reported when the caller does not ask for specific ones.
pub const DEFAULT_PERCENTILES: [f64; 3] = [99.0, 99.9, 100.0];

/// Computes a percentile over values sorted in ascending order.
///
/// Uses the rank `percentile / 100 * (n - 1)`. An integral rank selects that
/// element; a fractional rank interpolates linearly between the neighbouring
/// elements. Returns `None` for an empty slice.
///
/// ```
/// use benchmark_metrics::percentile::percentile_value;
///
/// assert_eq!(percentile_value(&[1.0, 2.0, 3.0, 4.0, 5.0], 50.0), Some(3.0));
/// assert_eq!(percentile_value(&[10.0, 20.0, 30.0, 40.0], 75.0), Some(32.5));
/// ```
#[must_use]
pub fn percentile_value(sorted_values: &[f64], percentile: f64) -> Option<f64> {
    let last = sorted_values.len().checked_sub(1)?;
    let rank = (percentile / 100.0 * last as f64).clamp(0.0, last as f64);
    let lower = rank.floor();
    let upper = rank.ceil();
    let lower_value = sorted_values[lower as usize];
    if lower == upper {
        return Some(lower_value);
    }
    let upper_value = sorted_values[upper as usize];
    Some(lower_value + (upper_value - lower_value) * (rank - lower))
}

/// Percentiles worth reporting for the given number of samples.
///
/// Larger samples resolve finer tail percentiles; every non-empty set ends
/// in 100. An empty sample reports nothing.
#[must_use]
pub fn percentiles_for_sample_size(sample_size: u64) -> &'static [f64] {
    match sample_size {
        0 => &[],
        1 => &[100.0],
        2..=9 => &[50.0, 100.0],
        10..=99 => &[50.0, 90.0, 100.0],
        100..=999 => &[50.0, 90.0, 99.0, 100.0],
        1_000..=9_999 => &[50.0, 90.0, 99.0, 99.9, 100.0],
        _ => &[50.0, 90.0, 99.0, 99.9, 99.99, 100.0],
    }
}

/// Encodes a percentile as a field name without dots, e.g. `99.9` as `"99_9"`.
#[must_use]
pub fn encode_float_key(key: f64) -> String {
    format!("{key:?}").replace('.', "_")
}

/// Inverse of [`encode_float_key`].
#[must_use]
pub fn decode_float_key(key: &str) -> Option<f64> {
    key.replace('_', ".").parse().ok()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_integral_rank_selects_element() {
        assert_eq!(percentile_value(&[1.0, 2.0, 3.0, 4.0, 5.0], 50.0), Some(3.0));
        assert_eq!(percentile_value(&[1.0, 2.0, 3.0, 4.0, 5.0], 100.0), Some(5.0));
        assert_eq!(percentile_value(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.0), Some(1.0));
    }

    #[test]
    fn test_fractional_rank_interpolates() {
        // rank = 0.75 * 3 = 2.25, between 30 and 40
        assert_eq!(percentile_value(&[10.0, 20.0, 30.0, 40.0], 75.0), Some(32.5));
        // rank = 0.5 * 1 = 0.5
        assert_eq!(percentile_value(&[100.0, 200.0], 50.0), Some(150.0));
    }

    #[test]
    fn test_single_value() {
        assert_eq!(percentile_value(&[42.0], 99.9), Some(42.0));
    }

    #[test]
    fn test_empty_is_none() {
        assert_eq!(percentile_value(&[], 50.0), None);
    }

    #[test]
    fn test_sample_size_table() {
        let cases: [(u64, &[f64]); 10] = [
            (1, &[100.0]),
            (5, &[50.0, 100.0]),
            (10, &[50.0, 90.0, 100.0]),
            (99, &[50.0, 90.0, 100.0]),
            (100, &[50.0, 90.0, 99.0, 100.0]),
            (999, &[50.0, 90.0, 99.0, 100.0]),
            (1_000, &[50.0, 90.0, 99.0, 99.9, 100.0]),
            (9_999, &[50.0, 90.0, 99.0, 99.9, 100.0]),
            (10_000, &[50.0, 90.0, 99.0, 99.9, 99.99, 100.0]),
            (100_000, &[50.0, 90.0, 99.0, 99.9, 99.99, 100.0]),
        ];
        for (n, expected) in cases {
            let actual = percentiles_for_sample_size(n);
            assert_eq!(actual, expected, "sample size {n}");
            assert_eq!(actual.last(), Some(&100.0));
        }
    }

    #[test]
    fn test_sample_size_zero_reports_nothing() {
        assert!(percentiles_for_sample_size(0).is_empty());
    }

    #[test]
    fn test_encode_float_key() {
        assert_eq!(encode_float_key(50.0), "50_0");
        assert_eq!(encode_float_key(99.9), "99_9");
        assert_eq!(encode_float_key(99.99), "99_99");
        assert_eq!(encode_float_key(100.0), "100_0");
        assert_eq!(decode_float_key("99_99"), Some(99.99));
        assert_eq!(decode_float_key("mean"), None);
    }

    proptest! {
        #[test]
        fn prop_percentile_within_bounds(
            mut values in prop::collection::vec(-1.0e6f64..1.0e6, 1..200),
            p in 0.0f64..=100.0,
        ) {
            values.sort_by(f64::total_cmp);
            let v = percentile_value(&values, p).unwrap_or(f64::NAN);
            prop_assert!(v >= values[0] - 1e-6 && v <= values[values.len() - 1] + 1e-6);
        }

        #[test]
        fn prop_percentile_monotonic_in_rank(
            mut values in prop::collection::vec(0.0f64..1.0e4, 1..100),
            a in 0.0f64..=100.0,
            b in 0.0f64..=100.0,
        ) {
            values.sort_by(f64::total_cmp);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let vlo = percentile_value(&values, lo).unwrap_or(f64::NAN);
            let vhi = percentile_value(&values, hi).unwrap_or(f64::NAN);
            prop_assert!(vlo <= vhi + 1e-9);
        }
    }
}
