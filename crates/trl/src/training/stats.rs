//! Flat statistics mapping handed to the logging sink.

use crate::Result;
use candle_core::{DType, Tensor};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A single statistic: a scalar or a distribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Scalar(f64),
    Array(Vec<f64>),
}

/// Name -> value mapping for one training iteration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainStats {
    entries: BTreeMap<String, StatValue>,
}

impl TrainStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.entries.insert(name.into(), StatValue::Scalar(value));
    }

    pub fn insert_array(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.entries.insert(name.into(), StatValue::Array(values));
    }

    /// Merge `other` into `self`, overwriting duplicate names
    pub fn extend(&mut self, other: TrainStats) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, name: &str) -> Option<&StatValue> {
        self.entries.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.entries.get(name) {
            Some(StatValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn array(&self, name: &str) -> Option<&[f64]> {
        match self.entries.get(name) {
            Some(StatValue::Array(v)) => Some(v),
            _ => None,
        }
    }

    /// Iterate in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Scalars only, in name order
    pub fn scalars(&self) -> impl Iterator<Item = (&str, f64)> {
        self.iter().filter_map(|(k, v)| match v {
            StatValue::Scalar(s) => Some((k, *s)),
            StatValue::Array(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates per-sub-batch scalars and reduces them to means.
#[derive(Debug, Default)]
pub struct StatsCollector {
    rows: BTreeMap<&'static str, Vec<f64>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &'static str, value: f64) {
        self.rows.entry(name).or_default().push(value);
    }

    /// All recorded values for `name`, in order
    pub fn values(&self, name: &str) -> &[f64] {
        self.rows.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mean of each recorded series
    pub fn means(&self) -> TrainStats {
        let mut stats = TrainStats::new();
        for (name, values) in &self.rows {
            stats.insert_scalar(*name, mean_var(values).0);
        }
        stats
    }
}

/// Wall-clock durations of pipeline stages, reported in seconds.
#[derive(Debug, Default)]
pub struct Timings {
    entries: Vec<(String, Duration)>,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: impl Into<String>, elapsed: Duration) {
        self.entries.push((name.into(), elapsed));
    }

    pub fn into_stats(self) -> TrainStats {
        let mut stats = TrainStats::new();
        for (name, elapsed) in self.entries {
            stats.insert_scalar(name, elapsed.as_secs_f64());
        }
        stats
    }
}

/// Population mean and variance; `(0, 0)` for an empty slice.
pub fn mean_var(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let arr = Array1::from_vec(values.to_vec());
    (arr.mean().unwrap_or(0.0), arr.var(0.0))
}

/// Copy any tensor to the host as a flat `f64` vector.
pub fn to_host(t: &Tensor) -> Result<Vec<f64>> {
    Ok(t.flatten_all()?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?)
}

/// Row sums of a `[batch, len]` tensor, on the host.
pub fn row_sums(t: &Tensor) -> Result<Vec<f64>> {
    to_host(&t.sum(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_scalar_and_array_access() {
        let mut stats = TrainStats::new();
        stats.insert_scalar("objective/kl", 0.5);
        stats.insert_array("objective/kl_dist", vec![0.1, 0.9]);

        assert_eq!(stats.scalar("objective/kl"), Some(0.5));
        assert_eq!(stats.scalar("objective/kl_dist"), None);
        assert_eq!(stats.array("objective/kl_dist"), Some(&[0.1, 0.9][..]));
        assert_eq!(stats.scalars().count(), 1);
    }

    #[test]
    fn test_serializes_flat() {
        let mut stats = TrainStats::new();
        stats.insert_scalar("a", 1.0);
        stats.insert_array("b", vec![2.0]);
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"a":1.0,"b":[2.0]}"#);
    }

    #[test]
    fn test_collector_means() {
        let mut collector = StatsCollector::new();
        collector.record("ppo/loss/policy", 1.0);
        collector.record("ppo/loss/policy", 3.0);
        collector.record("ppo/policy/clipfrac", 0.25);

        let stats = collector.means();
        assert_eq!(stats.scalar("ppo/loss/policy"), Some(2.0));
        assert_eq!(stats.scalar("ppo/policy/clipfrac"), Some(0.25));
        assert_eq!(collector.values("missing"), &[] as &[f64]);
    }

    #[test]
    fn test_timings_in_seconds() {
        let mut timings = Timings::new();
        timings.record("time/ppo/total", Duration::from_millis(1500));
        assert_eq!(timings.into_stats().scalar("time/ppo/total"), Some(1.5));
    }

    #[test]
    fn test_mean_var_population() {
        let (mean, var) = mean_var(&[1.0, 3.0]);
        assert_eq!(mean, 2.0);
        assert_eq!(var, 1.0);
        assert_eq!(mean_var(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_row_sums() {
        let t = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        assert_eq!(row_sums(&t).unwrap(), vec![3.0, 7.0]);
    }
}
