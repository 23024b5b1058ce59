//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Shared primitives and utilities for the dispatch runtime."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::time::Duration;

/// Convert a duration into microseconds, saturating at `u64::MAX`.
pub fn duration_to_micros(duration: Duration) -> u64 {
    duration.as_secs().saturating_mul(1_000_000) + u64::from(duration.subsec_micros())
}

/// Signed deviation of an actual interval from its expected value, in microseconds.
pub fn jitter_us(actual: Duration, expected: Duration) -> i64 {
    let actual_us = actual.as_secs_f64() * 1_000_000.0;
    let expected_us = expected.as_secs_f64() * 1_000_000.0;
    (actual_us - expected_us).round() as i64
}

/// Unwrap a wrapping u32 millisecond counter into a monotone u64 sequence.
///
/// The endpoint's timestamp field wraps roughly every 49.7 days; comparing
/// consecutive values through this helper keeps ordering checks meaningful
/// across the wrap boundary.
pub fn unwrap_timestamp(previous: u64, raw: u32) -> u64 {
    let prev_low = previous as u32;
    let delta = raw.wrapping_sub(prev_low);
    if delta < u32::MAX / 2 {
        previous.wrapping_add(u64::from(delta))
    } else {
        // raw stepped backwards without wrapping: report the previous value's
        // epoch with the raw low bits so regressions are visible to callers.
        previous.saturating_sub(u64::from(prev_low.wrapping_sub(raw)))
    }
}
