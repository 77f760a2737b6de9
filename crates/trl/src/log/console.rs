//! Console logging backend.

use super::MetricLogger;
use crate::training::{StatValue, TrainStats};
use crate::utils::abbreviate;
use std::fmt::Write;

/// Logger that prints metrics via tracing.
///
/// Arrays are summarized by their mean.
pub struct ConsoleLogger {
    prefixes: Vec<String>,
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self {
            prefixes: Vec::new(),
        }
    }

    /// Only print statistics whose name starts with one of `prefixes`
    pub fn with_prefixes<S: Into<String>>(prefixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    fn wanted(&self, name: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    fn format_line(&self, stats: &TrainStats, step: u64) -> String {
        let mut output = format!("Step {}: ", step);
        let mut first = true;
        for (name, value) in stats.iter().filter(|(n, _)| self.wanted(n)) {
            let value = match value {
                StatValue::Scalar(v) => *v,
                StatValue::Array(v) if v.is_empty() => continue,
                StatValue::Array(v) => v.iter().sum::<f64>() / v.len() as f64,
            };
            if !first {
                output.push_str(", ");
            }
            first = false;
            let _ = write!(output, "{}={}", name, abbreviate(value));
        }
        output
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_stats(&self, stats: &TrainStats, step: u64) {
        tracing::info!("{}", self.format_line(stats, step));
    }
}
