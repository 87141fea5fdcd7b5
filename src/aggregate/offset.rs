//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Monotonic-counter detection and baseline subtraction.
//!
//! A metric is offsetable when its densified series is a non-string,
//! non-constant sequence that never decreases, ignoring the sentinel `-1`.
//! Offsetable series get their first element subtracted so downstream
//! plots start at zero; the first observed value is recorded so the
//! subtraction can be reversed.
use crate::metrics::MetricValue;

pub fn is_offsetable(values: &[MetricValue], primary: &MetricValue) -> bool {
    if values.is_empty() || primary.is_str() {
        return false;
    }
    if values.windows(2).all(|pair| pair[0] == pair[1]) {
        return false;
    }
    let mut previous = 0.0;
    for value in values {
        match value.as_f64() {
            Some(number) => {
                if number == -1.0 {
                    continue;
                }
                if number < previous {
                    return false;
                }
                previous = number;
            }
            None => return false,
        }
    }
    true
}

/// Subtract the first element from every element in place, returning the
/// subtrahend. Empty columns are left untouched.
pub fn offset_column(column: &mut [MetricValue]) -> Option<MetricValue> {
    let base = column.first()?.clone();
    for value in column.iter_mut() {
        *value = value.subtract(&base);
    }
    Some(base)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ints(values: &[i64]) -> Vec<MetricValue> {
        values.iter().map(|v| MetricValue::Int(*v)).collect()
    }

    #[rstest]
    #[case(&[100, 101, 103, 103, 110], true)]
    #[case(&[5, 5, 5, 5], false)]
    #[case(&[3, 2, 5], false)]
    // The sentinel -1 is skipped, not treated as a decrease.
    #[case(&[5, -1, 6], true)]
    #[case(&[5, -1, 3], false)]
    #[case(&[0, 0, 1], true)]
    #[case(&[7], false)]
    #[case(&[], false)]
    #[case(&[-5, 10], false)]
    fn integer_classification(#[case] values: &[i64], #[case] expected: bool) {
        assert_eq!(is_offsetable(&ints(values), &MetricValue::Int(values.first().copied().unwrap_or(0))), expected);
    }

    #[test]
    fn string_primary_is_never_offsetable() {
        let values = vec![
            MetricValue::Str("a".to_string()),
            MetricValue::Str("b".to_string()),
        ];
        assert!(!is_offsetable(&values, &MetricValue::Str("a".to_string())));
    }

    #[test]
    fn mixed_string_values_are_not_offsetable() {
        let values = vec![MetricValue::Int(1), MetricValue::Str("x".to_string())];
        assert!(!is_offsetable(&values, &MetricValue::Int(1)));
    }

    #[test]
    fn float_series_classify_and_offset() {
        let mut values = vec![
            MetricValue::Float(1.5),
            MetricValue::Float(2.0),
            MetricValue::Float(2.0),
        ];
        assert!(is_offsetable(&values, &MetricValue::Float(1.5)));
        let base = offset_column(&mut values).unwrap();
        assert_eq!(base, MetricValue::Float(1.5));
        assert_eq!(
            values,
            vec![
                MetricValue::Float(0.0),
                MetricValue::Float(0.5),
                MetricValue::Float(0.5)
            ]
        );
    }

    #[test]
    fn offset_and_unoffset_round_trip() {
        let original = ints(&[100, 101, 103, 103, 110]);
        let mut values = original.clone();
        let base = offset_column(&mut values).unwrap();
        assert_eq!(values, ints(&[0, 1, 3, 3, 10]));
        let restored: Vec<MetricValue> = values
            .iter()
            .map(|v| match (v, &base) {
                (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a + b),
                _ => v.clone(),
            })
            .collect();
        assert_eq!(restored, original);
    }
}
