//! PPO training for language models.
//!
//! Provides:
//! - `BatchedForwardEvaluator` - chunked per-token log-probabilities and values
//! - `AdvantageEstimator` - KL-shaped rewards, GAE and whitening
//! - `KlController` - adaptive or fixed KL coefficient
//! - `PpoTrainer` - clipped-surrogate update over one rollout batch
//! - `RlhfRunner` - sample, score and train loop

mod advantage;
mod buffer;
mod config;
mod forward;
pub mod kl_controller;
pub mod ppo;
mod runner;
mod stats;
mod trainer;

pub use advantage::{compute_gae, compute_rewards, whiten, AdvantageEstimator};
pub use buffer::{shuffled_minibatch_indices, RolloutBatch};
pub use config::TrainerConfig;
pub use forward::{BatchedForwardEvaluator, ForwardOutput, RolloutSnapshot};
pub use kl_controller::{AdaptiveKlController, FixedKlController, KlController, MIN_KL_COEF};
pub use runner::{RlhfRunner, RunSummary};
pub use stats::{StatValue, StatsCollector, Timings, TrainStats};
pub use trainer::PpoTrainer;
