//! JSON-lines logging backend.

use super::MetricLogger;
use crate::training::TrainStats;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Serialize)]
struct Record<'a> {
    step: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<&'a TrainStats>,
}

/// Logger that appends one JSON object per call to a file.
pub struct JsonLinesLogger {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesLogger {
    /// Open `path` for appending, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, record: &Record<'_>) {
        let Ok(mut writer) = self.writer.lock() else {
            tracing::warn!("JSON-lines logger lock poisoned");
            return;
        };
        let result = serde_json::to_writer(&mut *writer, record)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            tracing::warn!(step = record.step, "Failed to write metrics: {}", e);
        }
    }
}

impl MetricLogger for JsonLinesLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        self.write(&Record {
            step,
            name: Some(name),
            value: Some(value),
            stats: None,
        });
    }

    fn log_stats(&self, stats: &TrainStats, step: u64) {
        self.write(&Record {
            step,
            name: None,
            value: None,
            stats: Some(stats),
        });
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}
