//! Utility functions.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Seeded generator for one consumer of randomness.
///
/// Different `stream`s from the same `seed` give unrelated sequences, so the
/// minibatch shuffle and the prompt draw do not mirror each other.
pub fn seeded_rng(seed: u64, stream: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Abbreviate a metric value for display
pub fn abbreviate(value: f64) -> String {
    let abs = value.abs();
    if !value.is_finite() || abs < 1_000.0 {
        format!("{:.4}", value)
    } else if abs < 1_000_000.0 {
        format!("{:.1}K", value / 1_000.0)
    } else if abs < 1_000_000_000.0 {
        format!("{:.1}M", value / 1_000_000.0)
    } else {
        format!("{:.1}B", value / 1_000_000_000.0)
    }
}

/// Format duration in human-readable form
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.0 || !seconds.is_finite() {
        return "0s".to_string();
    }

    let secs = seconds as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;

    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else if secs > 0 {
        format!("{}s", s)
    } else {
        format!("{:.0}ms", seconds * 1000.0)
    }
}
