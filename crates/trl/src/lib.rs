//! # trl
//!
//! Reinforcement learning from a scalar reward for autoregressive language
//! models, built on candle.
//!
//! ## Overview
//!
//! trl provides:
//! - `PpoTrainer` - clipped-surrogate PPO with a value baseline and an
//!   adaptive KL penalty against a frozen reference model
//! - `BatchedForwardEvaluator` - chunked log-probability / value passes
//! - `AdvantageEstimator` - per-token reward shaping and GAE
//! - `RlhfRunner` - the outer sample / score / step loop
//! - `MetricLogger` sinks (console, JSON lines, TensorBoard)
//! - `CheckpointManager` and `save_pretrained` for persistence
//!
//! ## Features
//!
//! - `default` - everything needed for CPU training
//! - `tensorboard` - TensorBoard event-file sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trl::prelude::*;
//!
//! let device = candle_core::Device::Cpu;
//! let policy = TinyCausalLm::new(TinyLmConfig::default(), &device)?;
//! let reference = policy.frozen_copy()?;
//! let config = TrainerConfig::default().with_batch_size(8, 4);
//!
//! let mut trainer = PpoTrainer::new(policy, reference, config)?;
//! let stats = trainer.step(&queries, &responses, &scores)?;
//! println!("kl = {:?}", stats.scalar("objective/kl"));
//! ```

pub mod checkpoint;
pub mod log;
pub mod policy;
pub mod reward;
pub mod tokenizer;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{
        save_pretrained, CheckpointConfig, CheckpointManager, Checkpointable, TrainerState,
    };
    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
    pub use crate::log::{CompositeLogger, ConsoleLogger, JsonLinesLogger, MetricLogger, NoOpLogger};
    pub use crate::policy::{
        CausalLm, HasVarMap, LmOutput, MultinomialSampler, SamplerConfig, SequenceSampler,
        TinyCausalLm, TinyLmConfig,
    };
    pub use crate::reward::{LexiconSentiment, RewardModel};
    pub use crate::tokenizer::{CharTokenizer, Tokenizer};
    pub use crate::training::{
        AdaptiveKlController, AdvantageEstimator, BatchedForwardEvaluator, FixedKlController,
        KlController, PpoTrainer, RlhfRunner, RunSummary, StatValue, TrainStats, TrainerConfig,
    };
    pub use crate::{Result, TrlError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum TrlError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Numeric instability during {stage} (batch {batch_index}): {detail}")]
    NumericInstability {
        stage: &'static str,
        batch_index: usize,
        detail: String,
    },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Collaborator error: {0}")]
    Collaborator(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl TrlError {
    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        TrlError::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrlError>;
