//! Checkpoint state and trait definitions.

use crate::policy::HasVarMap;
use crate::tokenizer::Tokenizer;
use crate::training::TrainerConfig;
use crate::{Result, TrlError};
use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Policy parameters (safetensors)
pub const MODEL_FILE: &str = "model.safetensors";
/// Tokenizer vocabulary
pub const VOCAB_FILE: &str = "vocab.json";
/// Iteration, KL coefficient and config
pub const STATE_FILE: &str = "trainer_state.json";

/// Trait for components that can be saved to and restored from a directory.
///
/// # Example
///
/// ```ignore
/// impl Checkpointable for MyTrainer {
///     fn save_to(&self, dir: &Path) -> Result<()> {
///         self.model.var_map().save(dir.join(MODEL_FILE))?;
///         Ok(())
///     }
///
///     fn load_from(&mut self, dir: &Path) -> Result<()> {
///         load_var_map(self.model.var_map(), dir.join(MODEL_FILE))
///     }
/// }
/// ```
pub trait Checkpointable {
    /// Write the component's state into `dir` (which already exists).
    fn save_to(&self, dir: &Path) -> Result<()>;

    /// Restore the component's state from `dir`.
    fn load_from(&mut self, dir: &Path) -> Result<()>;
}

/// Trainer bookkeeping stored next to the weights.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrainerState {
    /// Completed training iterations
    pub iteration: u64,
    /// KL coefficient at save time
    pub kl_coef: f64,
    /// Mean task reward of the last iteration, if known
    pub mean_reward: Option<f64>,
    /// Configuration the run was started with
    pub config: TrainerConfig,
    /// Seconds since the Unix epoch
    pub timestamp: String,
    /// trl version
    pub version: String,
}

impl TrainerState {
    pub fn new(iteration: u64, kl_coef: f64, config: TrainerConfig) -> Self {
        Self {
            iteration,
            kl_coef,
            mean_reward: None,
            config,
            timestamp: unix_timestamp(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn with_mean_reward(mut self, reward: f64) -> Self {
        self.mean_reward = Some(reward);
        self
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let file = std::fs::File::create(dir.join(STATE_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let file = std::fs::File::open(dir.join(STATE_FILE))?;
        Ok(serde_json::from_reader(file)?)
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

/// Overwrite every variable in `var_map` with the tensor of the same name in
/// a safetensors file.
pub fn load_var_map(var_map: &VarMap, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let data = var_map
        .data()
        .lock()
        .map_err(|_| TrlError::Training("var map lock poisoned".into()))?;

    for (name, var) in data.iter() {
        let value = tensors.get(name).ok_or_else(|| {
            TrlError::Training(format!("{} has no tensor named {name}", path.display()))
        })?;
        if value.dims() != var.dims() {
            return Err(TrlError::shape(format!("parameter {name}"), var.dims(), value.dims()));
        }
        var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
    }

    tracing::debug!(path = %path.display(), tensors = data.len(), "Loaded parameters");
    Ok(())
}

/// Write the trained policy, the tokenizer vocabulary and the trainer state
/// into `dir`, creating it if needed.
pub fn save_pretrained(
    dir: impl AsRef<Path>,
    policy: &dyn HasVarMap,
    tokenizer: &dyn Tokenizer,
    state: &TrainerState,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    policy.var_map().save(dir.join(MODEL_FILE))?;
    tokenizer.save(&dir.join(VOCAB_FILE))?;
    state.save(dir)?;

    tracing::info!(path = %dir.display(), iteration = state.iteration, "Saved pretrained model");
    Ok(dir.to_path_buf())
}
