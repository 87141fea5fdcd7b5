//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Metric values and parsed samples.
//!
//! A sample is a map from metric name to value. Values are integers where
//! parseable and strings otherwise; a value's type is stable for a given
//! metric across a run. Floats only appear when results are read back from
//! disk (JSON does not distinguish) and as the placeholder type for
//! fractional metrics.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Metric name -> value, for one source at one sample time.
pub type MetricMap = BTreeMap<String, MetricValue>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(value) => Some(*value as f64),
            MetricValue::Float(value) => Some(*value),
            MetricValue::Str(_) => None,
        }
    }

    pub fn is_str(&self) -> bool {
        matches!(self, MetricValue::Str(_))
    }

    /// The synthetic value standing in for this metric outside its sampled
    /// window: `"NA"` for strings, `0` for integers, `0.0` for floats.
    pub fn placeholder(&self) -> MetricValue {
        match self {
            MetricValue::Int(_) => MetricValue::Int(0),
            MetricValue::Float(_) => MetricValue::Float(0.0),
            MetricValue::Str(_) => MetricValue::Str("NA".to_string()),
        }
    }

    /// Baseline subtraction. Integer series stay integer; anything involving
    /// a float becomes float. Strings are never offset.
    pub fn subtract(&self, base: &MetricValue) -> MetricValue {
        match (self, base) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a - b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => MetricValue::Float(x - y),
                _ => a.clone(),
            },
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetricValue::Int(value) => write!(f, "{}", value),
            MetricValue::Float(value) => write!(f, "{}", value),
            MetricValue::Str(value) => write!(f, "{}", value),
        }
    }
}

/// Numeric extraction for raw metric text: strip everything that is not a
/// digit or a dot, then keep the value as an integer when that parses
/// cleanly. Anything else (fractions, flag words, `(comm)` fields) stays the
/// trimmed original string.
pub fn numeric_or_string(raw: &str) -> MetricValue {
    let trimmed = raw.trim();
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    match cleaned.parse::<i64>() {
        Ok(value) => MetricValue::Int(value),
        Err(_) => MetricValue::Str(trimmed.to_string()),
    }
}
