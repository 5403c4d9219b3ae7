//! Lightweight metrics helpers.

use std::time::Duration;

/// Median of the given values; lower midpoint for even counts.
pub fn median(values: &[u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some(((sorted[mid - 1] as u128 + sorted[mid] as u128) / 2) as u64)
    }
}

/// Blocks between the sync target and the local head.
pub fn lag_to_target(target: u64, head: u64) -> u64 {
    target.saturating_sub(head)
}

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}
