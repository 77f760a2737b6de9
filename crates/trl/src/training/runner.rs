//! Outer RLHF loop: draw prompts, generate, score, step.

use super::stats::{mean_var, Timings, TrainStats};
use super::trainer::PpoTrainer;
use crate::checkpoint::{self, CheckpointConfig, CheckpointManager};
use crate::log::{MetricLogger, NoOpLogger};
use crate::policy::{CausalLm, HasVarMap, SequenceSampler};
use crate::reward::RewardModel;
use crate::tokenizer::Tokenizer;
use crate::utils::{abbreviate, format_duration, seeded_rng};
use crate::{Result, TrlError};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Result of [`RlhfRunner::run`].
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Iterations completed in this run
    pub iterations: u64,
    /// Mean task reward of every iteration, in order
    pub mean_rewards: Vec<f64>,
    /// KL coefficient after the last iteration
    pub final_kl_coef: f64,
    /// Wall-clock time of the run
    pub elapsed: Duration,
}

/// Drives a [`PpoTrainer`] with a sampler, a tokenizer and a reward source.
///
/// ```ignore
/// let mut runner = RlhfRunner::new(trainer, sampler, reward, tokenizer)?
///     .with_logger(Box::new(ConsoleLogger::new()));
/// let summary = runner.run(&prompts)?;
/// runner.save_pretrained("out/model")?;
/// ```
pub struct RlhfRunner<P: CausalLm + HasVarMap, R: CausalLm> {
    trainer: PpoTrainer<P, R>,
    sampler: Box<dyn SequenceSampler>,
    reward: Box<dyn RewardModel>,
    tokenizer: Box<dyn Tokenizer>,
    logger: Box<dyn MetricLogger>,
    checkpoints: Option<CheckpointManager>,
    progress: Option<ProgressBar>,
    rng: StdRng,
    last_mean_reward: Option<f64>,
}

impl<P: CausalLm + HasVarMap, R: CausalLm> RlhfRunner<P, R> {
    /// Create a runner. Checkpointing is enabled when the trainer's
    /// `checkpoint_interval` is positive.
    pub fn new(
        trainer: PpoTrainer<P, R>,
        sampler: Box<dyn SequenceSampler>,
        reward: Box<dyn RewardModel>,
        tokenizer: Box<dyn Tokenizer>,
    ) -> Result<Self> {
        let config = trainer.config();
        if tokenizer.vocab_size() > trainer.policy().vocab_size() {
            return Err(TrlError::Configuration(format!(
                "tokenizer vocabulary ({}) exceeds model vocabulary ({})",
                tokenizer.vocab_size(),
                trainer.policy().vocab_size()
            )));
        }

        let checkpoints = if config.checkpoint_interval > 0 {
            let ckpt = CheckpointConfig::new(&config.data_dir).save_every(config.checkpoint_interval);
            Some(CheckpointManager::new(ckpt)?)
        } else {
            None
        };
        let rng = seeded_rng(config.seed, 1);

        Ok(Self {
            trainer,
            sampler,
            reward,
            tokenizer,
            logger: Box::new(NoOpLogger),
            checkpoints,
            progress: None,
            rng,
            last_mean_reward: None,
        })
    }

    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Show an indicatif progress bar over the configured epochs
    pub fn with_progress_bar(mut self) -> Self {
        let pb = ProgressBar::new(self.trainer.config().epochs as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        self.progress = Some(pb);
        self
    }

    pub fn trainer(&self) -> &PpoTrainer<P, R> {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut PpoTrainer<P, R> {
        &mut self.trainer
    }

    pub fn into_trainer(self) -> PpoTrainer<P, R> {
        self.trainer
    }

    /// Tokenize prompts and cut them to `txt_in_len`. Prompts that encode to
    /// fewer tokens are dropped.
    pub fn encode_prompts(&self, prompts: &[String]) -> Result<Vec<Vec<u32>>> {
        let len = self.trainer.config().txt_in_len;
        let mut pool = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let mut ids = self.tokenizer.encode(prompt)?;
            if ids.len() >= len {
                ids.truncate(len);
                pool.push(ids);
            }
        }

        tracing::debug!(
            prompts = prompts.len(),
            kept = pool.len(),
            txt_in_len = len,
            "Encoded prompt pool"
        );
        Ok(pool)
    }

    /// Run `epochs` iterations over prompts drawn from `prompts`.
    pub fn run(&mut self, prompts: &[String]) -> Result<RunSummary> {
        let start = Instant::now();
        let pool = self.encode_prompts(prompts)?;
        let bs = self.trainer.config().batch_size;
        if pool.len() < bs {
            return Err(TrlError::Configuration(format!(
                "prompt pool has {} usable prompts, batch_size is {bs}",
                pool.len()
            )));
        }

        let epochs = self.trainer.config().epochs;
        tracing::info!(epochs, batch_size = bs, pool = pool.len(), "Starting RLHF run");

        let mut mean_rewards = Vec::with_capacity(epochs);
        for _ in 0..epochs {
            let stats = self.run_iteration(&pool)?;
            let iteration = self.trainer.iteration();
            let reward = stats.scalar("env/reward_mean").unwrap_or(0.0);
            mean_rewards.push(reward);

            self.logger.log_stats(&stats, iteration);

            if let Some(manager) = self.checkpoints.as_mut() {
                manager.maybe_save(&self.trainer, iteration, reward)?;
            }

            let kl = stats.scalar("objective/kl").unwrap_or(0.0);
            if let Some(ref pb) = self.progress {
                pb.inc(1);
                pb.set_message(format!(
                    "Reward: {} KL: {} Elapsed: {}",
                    abbreviate(reward),
                    abbreviate(kl),
                    format_duration(start.elapsed().as_secs_f64())
                ));
            } else {
                tracing::info!(
                    iteration,
                    reward = reward,
                    kl = kl,
                    kl_coef = self.trainer.kl_coef(),
                    "Training progress"
                );
            }
        }

        if let Some(ref pb) = self.progress {
            pb.finish_with_message("Training complete");
        }
        self.logger.close();

        Ok(RunSummary {
            iterations: epochs as u64,
            mean_rewards,
            final_kl_coef: self.trainer.kl_coef(),
            elapsed: start.elapsed(),
        })
    }

    /// One iteration: draw a batch without replacement, generate, score, step.
    pub fn run_iteration(&mut self, pool: &[Vec<u32>]) -> Result<TrainStats> {
        let epoch_start = Instant::now();
        let config = self.trainer.config();
        let (bs, fbs, out_len) = (config.batch_size, config.forward_batch_size, config.txt_out_len);
        if pool.len() < bs {
            return Err(TrlError::Configuration(format!(
                "prompt pool has {} prompts, batch_size is {bs}",
                pool.len()
            )));
        }

        let mut timings = Timings::new();
        let queries: Vec<Vec<u32>> = rand::seq::index::sample(&mut self.rng, pool.len(), bs)
            .iter()
            .map(|i| pool[i].clone())
            .collect();

        let t = Instant::now();
        let pad = self.tokenizer.pad_token_id();
        let mut responses = Vec::with_capacity(bs);
        for chunk in queries.chunks(fbs) {
            let policy: &dyn CausalLm = self.trainer.policy();
            responses.extend(self.sampler.sample_batch(policy, chunk, out_len, pad)?);
        }
        timings.record("time/get_response", t.elapsed());

        let texts = queries
            .iter()
            .zip(&responses)
            .map(|(q, r)| Ok(self.tokenizer.decode(q)? + &self.tokenizer.decode(r)?))
            .collect::<Result<Vec<String>>>()?;

        let t = Instant::now();
        let scores = self.reward.score_batch(&texts)?;
        if scores.len() != bs {
            return Err(TrlError::shape("reward scores", vec![bs], vec![scores.len()]));
        }
        timings.record("time/get_sentiment", t.elapsed());

        let mut stats = self.trainer.step(&queries, &responses, &scores)?;

        let rewards: Vec<f64> = scores.iter().map(|s| *s as f64).collect();
        let (mean, var) = mean_var(&rewards);
        self.last_mean_reward = Some(mean);
        stats.insert_scalar("env/reward_mean", mean);
        stats.insert_scalar("env/reward_std", var.sqrt());
        stats.insert_array("env/reward_dist", rewards);

        timings.record("time/epoch", epoch_start.elapsed());
        stats.extend(timings.into_stats());
        Ok(stats)
    }

    /// Write the policy, the vocabulary and the trainer state to `dir`.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let mut state = self.trainer.state();
        if let Some(reward) = self.last_mean_reward {
            state = state.with_mean_reward(reward);
        }
        checkpoint::save_pretrained(dir, self.trainer.policy(), self.tokenizer.as_ref(), &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MultinomialSampler, SamplerConfig, TinyCausalLm, TinyLmConfig};
    use crate::reward::LexiconSentiment;
    use crate::tokenizer::CharTokenizer;
    use crate::training::TrainerConfig;
    use candle_core::Device;

    fn runner(config: TrainerConfig) -> RlhfRunner<TinyCausalLm, TinyCausalLm> {
        let tokenizer = CharTokenizer::from_corpus(["abcdefghijklmnopqrstuvwxyz ."]);
        let lm = TinyLmConfig {
            vocab_size: tokenizer.vocab_size(),
            hidden_size: 8,
            ..Default::default()
        };
        let policy = TinyCausalLm::new(lm, &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        let trainer = PpoTrainer::new(policy, reference, config).unwrap();
        RlhfRunner::new(
            trainer,
            Box::new(MultinomialSampler::new(SamplerConfig::default())),
            Box::new(LexiconSentiment::default()),
            Box::new(tokenizer),
        )
        .unwrap()
    }

    fn config() -> TrainerConfig {
        TrainerConfig::default()
            .with_batch_size(4, 2)
            .with_lengths(3, 4)
            .with_epochs(2)
            .with_ppo_epochs(1)
            .with_lr(1e-3)
    }

    fn prompts() -> Vec<String> {
        ["the movie", "this film", "a story", "i think", "it was", "no"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_encode_prompts_truncates_and_filters() {
        let runner = runner(config());
        let pool = runner.encode_prompts(&prompts()).unwrap();
        // "no" is shorter than txt_in_len
        assert_eq!(pool.len(), 5);
        assert!(pool.iter().all(|p| p.len() == 3));
    }

    #[test]
    fn test_run_iteration_adds_env_stats() {
        let mut runner = runner(config());
        let pool = runner.encode_prompts(&prompts()).unwrap();
        let stats = runner.run_iteration(&pool).unwrap();

        assert!(stats.scalar("env/reward_mean").is_some());
        assert!(stats.scalar("env/reward_std").unwrap() >= 0.0);
        assert_eq!(stats.array("env/reward_dist").unwrap().len(), 4);
        assert!(stats.scalar("time/get_response").is_some());
        assert!(stats.scalar("time/get_sentiment").is_some());
        assert!(stats.scalar("time/epoch").is_some());
        assert!(stats.scalar("ppo/loss/total").is_some());
    }

    #[test]
    fn test_run_completes_epochs() {
        let mut runner = runner(config());
        let summary = runner.run(&prompts()).unwrap();
        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.mean_rewards.len(), 2);
        assert_eq!(runner.trainer().iteration(), 2);
    }

    #[test]
    fn test_small_pool_is_configuration_error() {
        let mut runner = runner(config());
        let err = runner.run(&prompts()[..3]);
        assert!(matches!(err, Err(TrlError::Configuration(_))));
        assert_eq!(runner.trainer().iteration(), 0);
    }

    #[test]
    fn test_rejects_tokenizer_larger_than_model() {
        let tokenizer = CharTokenizer::from_corpus(["abcdefghijklmnopqrstuvwxyz"]);
        let lm = TinyLmConfig {
            vocab_size: 4,
            hidden_size: 4,
            ..Default::default()
        };
        let policy = TinyCausalLm::new(lm, &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        let trainer = PpoTrainer::new(policy, reference, config()).unwrap();
        let result = RlhfRunner::new(
            trainer,
            Box::new(MultinomialSampler::new(SamplerConfig::default())),
            Box::new(LexiconSentiment::default()),
            Box::new(tokenizer),
        );
        assert!(matches!(result, Err(TrlError::Configuration(_))));
    }
}
