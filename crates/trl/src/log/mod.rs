//! Metric sinks.
//!
//! Provides:
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` for lightweight stdout logging
//! - `JsonLinesLogger` for one JSON object per iteration
//! - `TensorBoardLogger` for visualization (optional)
//! - `CompositeLogger` for multi-backend logging
//!
//! Sinks never return errors: a failing sink warns and keeps going.

mod console;
mod jsonl;
mod logger;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use jsonl::JsonLinesLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;
