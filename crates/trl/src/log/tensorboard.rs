//! TensorBoard logging backend.

use super::MetricLogger;
use crate::training::{StatValue, TrainStats};
use std::path::Path;
use std::sync::Mutex;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Logger that writes to TensorBoard event files.
///
/// Arrays are written as `<name>/mean`, `<name>/min` and `<name>/max` scalars.
pub struct TensorBoardLogger {
    writer: Mutex<SummaryWriter>,
}

impl TensorBoardLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        let writer = SummaryWriter::new(log_dir.as_ref());
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl MetricLogger for TensorBoardLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.add_scalar(name, value as f32, step as usize);
            let _ = writer.flush();
        }
    }

    fn log_stats(&self, stats: &TrainStats, step: u64) {
        let Ok(mut writer) = self.writer.lock() else {
            tracing::warn!("TensorBoard writer lock poisoned");
            return;
        };
        for (name, value) in stats.iter() {
            match value {
                StatValue::Scalar(v) => writer.add_scalar(name, *v as f32, step as usize),
                StatValue::Array(v) if !v.is_empty() => {
                    let mean = v.iter().sum::<f64>() / v.len() as f64;
                    let min = v.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    writer.add_scalar(&format!("{name}/mean"), mean as f32, step as usize);
                    writer.add_scalar(&format!("{name}/min"), min as f32, step as usize);
                    writer.add_scalar(&format!("{name}/max"), max as f32, step as usize);
                }
                StatValue::Array(_) => {}
            }
        }
        let _ = writer.flush();
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}
