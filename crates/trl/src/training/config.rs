//! Trainer configuration.

use crate::{Result, TrlError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Run-level configuration for the PPO trainer.
///
/// Validated once by [`TrainerConfig::validate`] before any model is touched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    // Batching
    /// Trajectories per rollout batch
    pub batch_size: usize,
    /// Sub-batch size for forward passes and optimization steps
    pub forward_batch_size: usize,
    /// Prompt length in tokens
    pub txt_in_len: usize,
    /// Continuation length in tokens
    pub txt_out_len: usize,

    // Optimization
    /// Learning rate
    pub lr: f64,
    /// Optimization passes over each rollout batch
    pub ppo_epochs: usize,
    /// Total training iterations
    pub epochs: usize,
    /// Global gradient-norm clip (disabled when `None`)
    pub max_grad_norm: Option<f64>,

    // KL penalty
    /// Initial KL coefficient (beta)
    pub init_kl_coef: f64,
    /// Adapt beta towards `target`; when false beta stays at `init_kl_coef`
    pub adap_kl_ctrl: bool,
    /// Target per-token KL divergence
    pub target: f64,
    /// Horizon (in trajectories) over which beta adapts
    pub horizon: f64,

    // PPO hyperparameters
    /// Discount factor
    pub gamma: f64,
    /// GAE lambda
    pub lam: f64,
    /// Policy clip range
    pub cliprange: f64,
    /// Value clip range
    pub cliprange_value: f64,
    /// Value loss coefficient
    pub vf_coef: f64,

    // Checkpointing
    /// Checkpoint every N iterations (0 disables)
    pub checkpoint_interval: u64,
    /// Directory for checkpoints
    pub data_dir: String,

    /// Random seed for shuffling and sampling
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            forward_batch_size: 16,
            txt_in_len: 5,
            txt_out_len: 20,

            lr: 1.41e-5,
            ppo_epochs: 4,
            epochs: 10,
            max_grad_norm: None,

            init_kl_coef: 0.2,
            adap_kl_ctrl: true,
            target: 0.3,
            horizon: 10_000.0,

            gamma: 1.0,
            lam: 0.95,
            cliprange: 0.2,
            cliprange_value: 0.2,
            vf_coef: 0.1,

            checkpoint_interval: 0,
            data_dir: "checkpoints".to_string(),

            seed: 1,
        }
    }
}

impl TrainerConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(file)?;
        Ok(config)
    }

    /// Set rollout and sub-batch sizes
    pub fn with_batch_size(mut self, batch_size: usize, forward_batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.forward_batch_size = forward_batch_size;
        self
    }

    /// Set prompt and continuation lengths
    pub fn with_lengths(mut self, txt_in_len: usize, txt_out_len: usize) -> Self {
        self.txt_in_len = txt_in_len;
        self.txt_out_len = txt_out_len;
        self
    }

    /// Set learning rate
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    /// Set number of training iterations
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set number of optimization passes per rollout batch
    pub fn with_ppo_epochs(mut self, ppo_epochs: usize) -> Self {
        self.ppo_epochs = ppo_epochs;
        self
    }

    /// Hold beta fixed at `init_kl_coef`
    pub fn with_fixed_kl(mut self, init_kl_coef: f64) -> Self {
        self.init_kl_coef = init_kl_coef;
        self.adap_kl_ctrl = false;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of sub-batches per rollout batch
    pub fn num_minibatches(&self) -> usize {
        self.batch_size / self.forward_batch_size
    }

    /// Full sequence length (prompt + continuation)
    pub fn seq_len(&self) -> usize {
        self.txt_in_len + self.txt_out_len
    }

    /// Check every hyperparameter. Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: String) -> Result<()> {
            Err(TrlError::Configuration(msg))
        }

        if self.batch_size == 0 {
            return bad("batch_size must be positive".into());
        }
        if self.forward_batch_size == 0 {
            return bad("forward_batch_size must be positive".into());
        }
        if self.batch_size % self.forward_batch_size != 0 {
            return bad(format!(
                "forward_batch_size ({}) must divide batch_size ({})",
                self.forward_batch_size, self.batch_size
            ));
        }
        if self.txt_in_len == 0 {
            return bad("txt_in_len must be at least 1".into());
        }
        if self.txt_out_len == 0 {
            return bad("txt_out_len must be at least 1".into());
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return bad(format!("lr must be positive and finite, got {}", self.lr));
        }
        if self.ppo_epochs == 0 {
            return bad("ppo_epochs must be at least 1".into());
        }
        if !(self.cliprange.is_finite() && self.cliprange > 0.0) {
            return bad(format!("cliprange must be positive, got {}", self.cliprange));
        }
        if !(self.cliprange_value.is_finite() && self.cliprange_value > 0.0) {
            return bad(format!(
                "cliprange_value must be positive, got {}",
                self.cliprange_value
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return bad(format!("gamma must lie in [0, 1], got {}", self.gamma));
        }
        if !(0.0..=1.0).contains(&self.lam) {
            return bad(format!("lam must lie in [0, 1], got {}", self.lam));
        }
        if !(self.vf_coef.is_finite() && self.vf_coef >= 0.0) {
            return bad(format!("vf_coef must be non-negative, got {}", self.vf_coef));
        }
        if !(self.init_kl_coef.is_finite() && self.init_kl_coef >= 0.0) {
            return bad(format!(
                "init_kl_coef must be non-negative, got {}",
                self.init_kl_coef
            ));
        }
        if self.adap_kl_ctrl {
            if !(self.target.is_finite() && self.target > 0.0) {
                return bad(format!("target must be positive, got {}", self.target));
            }
            if !(self.horizon.is_finite() && self.horizon > 0.0) {
                return bad(format!("horizon must be positive, got {}", self.horizon));
            }
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return bad(format!("max_grad_norm must be positive, got {norm}"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_config_error(config: TrainerConfig) {
        match config.validate() {
            Err(TrlError::Configuration(_)) => {}
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = TrainerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_minibatches(), 16);
        assert_eq!(config.seq_len(), 25);
    }

    #[test]
    fn test_forward_batch_size_must_divide() {
        assert_config_error(TrainerConfig::default().with_batch_size(10, 4));
        TrainerConfig::default().with_batch_size(12, 4).validate().unwrap();
    }

    #[test]
    fn test_rejects_non_positive_clip_ranges() {
        assert_config_error(TrainerConfig {
            cliprange: 0.0,
            ..Default::default()
        });
        assert_config_error(TrainerConfig {
            cliprange_value: -0.1,
            ..Default::default()
        });
    }

    #[test]
    fn test_rejects_bad_lengths_and_discounts() {
        assert_config_error(TrainerConfig::default().with_lengths(0, 4));
        assert_config_error(TrainerConfig::default().with_lengths(4, 0));
        assert_config_error(TrainerConfig {
            gamma: 1.5,
            ..Default::default()
        });
        assert_config_error(TrainerConfig {
            lam: -0.1,
            ..Default::default()
        });
    }

    #[test]
    fn test_fixed_kl_skips_target_checks() {
        let config = TrainerConfig {
            target: 0.0,
            horizon: 0.0,
            ..Default::default()
        };
        assert_config_error(config.clone());
        config.with_fixed_kl(0.1).validate().unwrap();
    }

    #[test]
    fn test_json_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "batch_size": 8, "forward_batch_size": 2, "lr": 0.001 }"#)
            .unwrap();

        let config = TrainerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.forward_batch_size, 2);
        assert_eq!(config.lr, 0.001);
        assert_eq!(config.txt_out_len, 20);
    }
}
