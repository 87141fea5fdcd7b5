//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Canonical run timestamps.
//!
//! Sample timestamps are local wall-clock instants rendered as
//! `%Y_%m_%d_%H_%M_%S_%6f` strings (microsecond precision). The string form
//! is the canonical key everywhere: buffer keys, fragment files and the
//! merged result all use it, and the fixed-width rendering makes
//! lexicographic order equal chronological order. Timestamps are only parsed
//! back to seconds for scheduling arithmetic.
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use eyre::{eyre, Context, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S_%6f";

pub fn now_string() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Convert a canonical timestamp string back to seconds (with fractional
/// microseconds). Only differences of these values are meaningful.
pub fn to_seconds(timestamp: &str) -> Result<f64> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .wrap_err_with(|| eyre!("Unrecognized timestamp: {}", timestamp))?;
    Ok(parsed.and_utc().timestamp_micros() as f64 / 1_000_000.0)
}

// std::thread::sleep continues sleeping on SIGINT but the tick sleep must be
// interruptible so we use shuteye::sleep.
pub fn interruptible_sleep(duration: Duration) {
    let _ = shuteye::sleep(duration);
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn now_string_round_trips() {
        let ts = now_string();
        assert!(to_seconds(&ts).is_ok());
    }

    #[rstest]
    #[case("2024_05_01_10_00_01_000000", "2024_05_01_10_00_00_000000", 1.0)]
    #[case("2024_05_01_10_00_00_500000", "2024_05_01_10_00_00_000000", 0.5)]
    #[case("2024_05_01_10_01_00_000000", "2024_05_01_10_00_59_750000", 0.25)]
    fn seconds_differences(#[case] later: &str, #[case] earlier: &str, #[case] expected: f64) {
        let delta = to_seconds(later).unwrap() - to_seconds(earlier).unwrap();
        assert!((delta - expected).abs() < 1e-6);
    }

    #[test]
    fn string_order_is_chronological() {
        let a = "2024_05_01_09_59_59_999999";
        let b = "2024_05_01_10_00_00_000000";
        assert!(a < b);
        assert!(to_seconds(a).unwrap() < to_seconds(b).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(to_seconds("not-a-timestamp").is_err());
    }
}
