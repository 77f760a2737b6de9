//! Checkpoint manager with rotation and best-iteration tracking.

use super::state::Checkpointable;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

const ITER_PREFIX: &str = "checkpoint_iter_";
const BEST_DIR: &str = "checkpoint_best";

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory holding one sub-directory per checkpoint
    pub checkpoint_dir: PathBuf,
    /// Save every N iterations
    pub save_every: u64,
    /// Keep only the last N checkpoints (0 = keep all)
    pub keep_last: usize,
    /// Also keep a copy of the highest-reward checkpoint
    pub save_best: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            save_every: 10,
            keep_last: 5,
            save_best: true,
        }
    }
}

impl CheckpointConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }

    pub fn save_every(mut self, iterations: u64) -> Self {
        self.save_every = iterations;
        self
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }

    pub fn save_best(mut self, enabled: bool) -> Self {
        self.save_best = enabled;
        self
    }
}

/// Manages checkpoint lifecycle.
///
/// ```ignore
/// let mut manager = CheckpointManager::new(CheckpointConfig::new("./ckpt").save_every(5))?;
///
/// // In the training loop:
/// manager.maybe_save(&trainer, iteration, mean_reward)?;
///
/// // To resume:
/// if let Some(iteration) = manager.load_latest(&mut trainer)? {
///     println!("Resumed from iteration {iteration}");
/// }
/// ```
pub struct CheckpointManager {
    config: CheckpointConfig,
    best_reward: f64,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        fs::create_dir_all(&config.checkpoint_dir)?;
        Ok(Self {
            config,
            best_reward: f64::NEG_INFINITY,
        })
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Highest reward saved so far
    pub fn best_reward(&self) -> Option<f64> {
        self.best_reward.is_finite().then_some(self.best_reward)
    }

    /// Save when `iteration` is a positive multiple of `save_every`.
    pub fn maybe_save<T: Checkpointable>(
        &mut self,
        trainable: &T,
        iteration: u64,
        reward: f64,
    ) -> Result<Option<PathBuf>> {
        if self.config.save_every == 0 || iteration == 0 || iteration % self.config.save_every != 0
        {
            return Ok(None);
        }
        self.save(trainable, iteration, reward).map(Some)
    }

    /// Save a checkpoint regardless of `save_every`.
    pub fn save<T: Checkpointable>(
        &mut self,
        trainable: &T,
        iteration: u64,
        reward: f64,
    ) -> Result<PathBuf> {
        let path = self
            .config
            .checkpoint_dir
            .join(format!("{ITER_PREFIX}{iteration:06}"));
        fs::create_dir_all(&path)?;
        trainable.save_to(&path)?;
        tracing::info!(path = %path.display(), iteration, "Saved checkpoint");

        if self.config.save_best && reward > self.best_reward {
            self.best_reward = reward;
            let best = self.config.checkpoint_dir.join(BEST_DIR);
            if best.exists() {
                fs::remove_dir_all(&best)?;
            }
            copy_dir(&path, &best)?;
            tracing::info!(reward, iteration, "New best checkpoint");
        }

        if self.config.keep_last > 0 {
            self.cleanup_old_checkpoints()?;
        }

        Ok(path)
    }

    /// Load the most recent checkpoint. Returns its iteration.
    pub fn load_latest<T: Checkpointable>(&self, trainable: &mut T) -> Result<Option<u64>> {
        let Some(path) = self.list_checkpoints()?.pop() else {
            return Ok(None);
        };
        trainable.load_from(&path)?;
        let iteration = iteration_of(&path);
        tracing::info!(path = %path.display(), iteration, "Loaded checkpoint");
        Ok(Some(iteration))
    }

    /// Load the best checkpoint. Returns false when none exists.
    pub fn load_best<T: Checkpointable>(&self, trainable: &mut T) -> Result<bool> {
        let best = self.config.checkpoint_dir.join(BEST_DIR);
        if !best.is_dir() {
            return Ok(false);
        }
        trainable.load_from(&best)?;
        tracing::info!("Loaded best checkpoint");
        Ok(true)
    }

    /// Iteration checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.config.checkpoint_dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut checkpoints: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(ITER_PREFIX))
                        .unwrap_or(false)
            })
            .collect();

        checkpoints.sort();
        Ok(checkpoints)
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;

        while checkpoints.len() > self.config.keep_last {
            let old = checkpoints.remove(0);
            if let Err(e) = fs::remove_dir_all(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }

        Ok(())
    }
}

fn iteration_of(path: &Path) -> u64 {
    path.file_name()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix(ITER_PREFIX))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
