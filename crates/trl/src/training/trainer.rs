//! PPO trainer for causal language models.

use super::advantage::{compute_rewards, AdvantageEstimator};
use super::buffer::{shuffled_minibatch_indices, RolloutBatch};
use super::config::TrainerConfig;
use super::forward::{BatchedForwardEvaluator, RolloutSnapshot};
use super::kl_controller::{self, KlController};
use super::ppo::{
    approx_kl, clip_fraction, explained_variance, ppo_policy_loss, ppo_value_loss,
    value_clip_fraction,
};
use super::stats::{mean_var, row_sums, to_host, StatsCollector, Timings, TrainStats};
use crate::checkpoint::{load_var_map, Checkpointable, TrainerState, MODEL_FILE};
use crate::policy::{CausalLm, HasVarMap};
use crate::utils::seeded_rng;
use crate::{Result, TrlError};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use std::path::Path;
use std::time::Instant;

/// PPO trainer.
///
/// Owns the trainable policy, the frozen reference model, the optimizer and
/// the KL controller. Each [`PpoTrainer::step`] consumes one rollout batch.
pub struct PpoTrainer<P: CausalLm + HasVarMap, R: CausalLm> {
    config: TrainerConfig,
    policy: P,
    reference: R,
    optimizer: AdamW,
    kl_ctl: Box<dyn KlController>,
    evaluator: BatchedForwardEvaluator,
    estimator: AdvantageEstimator,
    rng: StdRng,
    iteration: u64,
}

impl<P: CausalLm + HasVarMap, R: CausalLm> PpoTrainer<P, R> {
    /// Create a trainer. The config is validated before anything else.
    pub fn new(policy: P, reference: R, config: TrainerConfig) -> Result<Self> {
        config.validate()?;

        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(policy.var_map().all_vars(), params)?;

        tracing::info!(
            parameters = policy.num_parameters(),
            batch_size = config.batch_size,
            forward_batch_size = config.forward_batch_size,
            adaptive_kl = config.adap_kl_ctrl,
            "Created PPO trainer"
        );

        Ok(Self {
            kl_ctl: kl_controller::from_config(&config),
            evaluator: BatchedForwardEvaluator::new(
                config.forward_batch_size,
                config.txt_in_len,
                config.txt_out_len,
            )?,
            estimator: AdvantageEstimator::new(config.gamma, config.lam),
            rng: seeded_rng(config.seed, 0),
            iteration: 0,
            config,
            policy,
            reference,
            optimizer,
        })
    }

    /// Replace the KL controller
    pub fn with_kl_controller(mut self, kl_ctl: Box<dyn KlController>) -> Self {
        self.kl_ctl = kl_ctl;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn reference(&self) -> &R {
        &self.reference
    }

    /// Current KL coefficient (beta)
    pub fn kl_coef(&self) -> f64 {
        self.kl_ctl.value()
    }

    /// Completed steps
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Bookkeeping for checkpoints and `save_pretrained`
    pub fn state(&self) -> TrainerState {
        TrainerState::new(self.iteration, self.kl_ctl.value(), self.config.clone())
    }

    /// Give back the trained policy
    pub fn into_policy(self) -> P {
        self.policy
    }

    /// Run one PPO step on a rollout batch.
    ///
    /// `queries[i]` has `txt_in_len` tokens, `responses[i]` has `txt_out_len`
    /// tokens and `scores[i]` is the task reward of trajectory `i`.
    pub fn step(
        &mut self,
        queries: &[Vec<u32>],
        responses: &[Vec<u32>],
        scores: &[f32],
    ) -> Result<TrainStats> {
        let total_start = Instant::now();
        let bs = self.config.batch_size;
        for (name, len) in [
            ("queries", queries.len()),
            ("responses", responses.len()),
            ("scores", scores.len()),
        ] {
            if len != bs {
                return Err(TrlError::shape(name, vec![bs], vec![len]));
            }
        }

        let mut timings = Timings::new();

        let t = Instant::now();
        let input_ids = self
            .evaluator
            .build_input_ids(queries, responses, self.policy.device())?;
        let snapshot = self
            .evaluator
            .snapshot(&self.policy, &self.reference, &input_ids)?;
        timings.record("time/ppo/forward_pass", t.elapsed());

        let t = Instant::now();
        let kl_coef = self.kl_ctl.value();
        let scores_t = Tensor::from_slice(scores, bs, self.policy.device())?;
        let (rewards, non_score) =
            compute_rewards(&scores_t, &snapshot.logprobs, &snapshot.ref_logprobs, kl_coef)?;
        let (advantages, returns) = self.estimator.estimate(&rewards, &snapshot.values)?;
        let batch = RolloutBatch::new(&snapshot, advantages, returns)?;
        timings.record("time/ppo/compute_rewards", t.elapsed());

        let t = Instant::now();
        let mut collector = StatsCollector::new();
        let mut approxkl_per_epoch = Vec::with_capacity(self.config.ppo_epochs);
        let mut batch_index = 0;
        for _ in 0..self.config.ppo_epochs {
            let start = collector.values("ppo/policy/approxkl").len();
            let chunks =
                shuffled_minibatch_indices(bs, self.config.forward_batch_size, &mut self.rng);
            for indices in chunks {
                let minibatch = batch.minibatch(&indices)?;
                self.train_minibatch(&minibatch, batch_index, &mut collector)?;
                batch_index += 1;
            }
            let epoch_kls = &collector.values("ppo/policy/approxkl")[start..];
            approxkl_per_epoch.push(mean_var(epoch_kls).0);
        }
        timings.record("time/ppo/optimize_step", t.elapsed());

        let t = Instant::now();
        let mut stats = self.batch_stats(&snapshot, &non_score, &batch, kl_coef)?;
        stats.extend(collector.means());
        stats.insert_array("ppo/policy/approxkl_per_epoch", approxkl_per_epoch);

        // controller sees the pre-optimization snapshot only
        let kl_per_token = scalar_mean(&snapshot.kl()?)?;
        self.kl_ctl.update(kl_per_token, bs);
        self.iteration += 1;
        timings.record("time/ppo/calc_stats", t.elapsed());
        timings.record("time/ppo/total", total_start.elapsed());
        stats.extend(timings.into_stats());

        tracing::debug!(
            iteration = self.iteration,
            kl = kl_per_token,
            kl_coef = self.kl_ctl.value(),
            loss = stats.scalar("ppo/loss/total").unwrap_or(f64::NAN),
            "PPO step complete"
        );

        Ok(stats)
    }

    /// One gradient step on a sub-batch. Nothing is applied when the loss or
    /// the gradients are non-finite.
    fn train_minibatch(
        &mut self,
        minibatch: &RolloutBatch,
        batch_index: usize,
        collector: &mut StatsCollector,
    ) -> Result<()> {
        let out = self.evaluator.forward(&self.policy, &minibatch.input_ids)?;

        let pg_loss = ppo_policy_loss(
            &minibatch.advantages,
            &out.logprobs,
            &minibatch.logprobs,
            self.config.cliprange,
        )?;
        let vf_loss = ppo_value_loss(
            &out.values,
            &minibatch.values,
            &minibatch.returns,
            self.config.cliprange_value,
        )?;
        let loss = (&pg_loss + (&vf_loss * self.config.vf_coef)?)?;

        let pg_value = pg_loss.to_scalar::<f32>()? as f64;
        let vf_value = vf_loss.to_scalar::<f32>()? as f64;
        let loss_value = loss.to_scalar::<f32>()? as f64;
        if !loss_value.is_finite() {
            return Err(TrlError::NumericInstability {
                stage: "loss",
                batch_index,
                detail: format!("policy loss {pg_value}, value loss {vf_value}"),
            });
        }

        let mut grads = loss.backward()?;
        let vars = self.policy.var_map().all_vars();
        let grad_norm = global_grad_norm(&grads, &vars)?;
        if !grad_norm.is_finite() {
            return Err(TrlError::NumericInstability {
                stage: "gradients",
                batch_index,
                detail: format!("gradient norm {grad_norm}"),
            });
        }
        if let Some(max_norm) = self.config.max_grad_norm {
            if grad_norm > max_norm {
                scale_grads(&mut grads, &vars, max_norm / (grad_norm + 1e-6))?;
            }
        }
        self.optimizer.step(&grads)?;

        let logprobs = out.logprobs.detach();
        let values = out.values.detach();
        let ratio = (&logprobs - &minibatch.logprobs)?.exp()?;
        let vpred = to_host(&values)?;
        let returns = to_host(&minibatch.returns)?;
        let value_error = vpred
            .iter()
            .zip(&returns)
            .map(|(v, r)| (v - r).powi(2))
            .sum::<f64>()
            / vpred.len().max(1) as f64;
        let vpred_f32: Vec<f32> = vpred.iter().map(|v| *v as f32).collect();
        let returns_f32: Vec<f32> = returns.iter().map(|r| *r as f32).collect();

        collector.record("ppo/loss/policy", pg_value);
        collector.record("ppo/loss/value", vf_value);
        collector.record("ppo/loss/total", loss_value);
        collector.record("ppo/policy/entropy", scalar_mean(&out.entropy)?);
        collector.record(
            "ppo/policy/approxkl",
            approx_kl(&logprobs, &minibatch.logprobs)?,
        );
        collector.record(
            "ppo/policy/clipfrac",
            clip_fraction(&ratio, self.config.cliprange)?,
        );
        collector.record(
            "ppo/policy/advantages_mean",
            scalar_mean(&minibatch.advantages)?,
        );
        collector.record("ppo/policy/ratio_mean", scalar_mean(&ratio)?);
        collector.record("ppo/policy/grad_norm", grad_norm);
        collector.record("ppo/val/vpred", mean_var(&vpred).0);
        collector.record("ppo/val/error", value_error);
        collector.record(
            "ppo/val/clipfrac",
            value_clip_fraction(
                &values,
                &minibatch.values,
                &minibatch.returns,
                self.config.cliprange_value,
            )?,
        );
        collector.record(
            "ppo/val/var_explained",
            explained_variance(&vpred_f32, &returns_f32),
        );

        Ok(())
    }

    /// Statistics of the frozen snapshot and the shaped rewards.
    fn batch_stats(
        &self,
        snapshot: &RolloutSnapshot,
        non_score: &Tensor,
        batch: &RolloutBatch,
        kl_coef: f64,
    ) -> Result<TrainStats> {
        let mut stats = TrainStats::new();

        let kl = snapshot.kl()?;
        let kl_per_sequence = row_sums(&kl)?;
        let non_score_per_sequence = row_sums(non_score)?;
        let entropy_per_sequence = row_sums(&snapshot.entropy)?;

        stats.insert_scalar("objective/kl", mean_var(&kl_per_sequence).0);
        stats.insert_array("objective/kl_dist", kl_per_sequence);
        stats.insert_scalar("objective/kl_per_token", scalar_mean(&kl)?);
        stats.insert_scalar("objective/kl_coef", kl_coef);
        stats.insert_scalar("objective/logprobs", scalar_mean(&snapshot.logprobs)?);
        stats.insert_scalar("objective/ref_logprobs", scalar_mean(&snapshot.ref_logprobs)?);
        stats.insert_scalar("objective/entropy", mean_var(&entropy_per_sequence).0);
        stats.insert_scalar(
            "ppo/mean_non_score_reward",
            mean_var(&non_score_per_sequence).0,
        );

        stats.insert_array("ppo/policy/advantages", to_host(&batch.advantages)?);

        let (returns_mean, returns_var) = mean_var(&to_host(&batch.returns)?);
        stats.insert_scalar("ppo/returns/mean", returns_mean);
        stats.insert_scalar("ppo/returns/var", returns_var);

        let (val_mean, val_var) = mean_var(&to_host(&batch.values)?);
        stats.insert_scalar("ppo/val/mean", val_mean);
        stats.insert_scalar("ppo/val/var", val_var);

        Ok(stats)
    }
}

impl<P: CausalLm + HasVarMap, R: CausalLm> Checkpointable for PpoTrainer<P, R> {
    fn save_to(&self, dir: &Path) -> Result<()> {
        self.policy.var_map().save(dir.join(MODEL_FILE))?;
        self.state().save(dir)
    }

    fn load_from(&mut self, dir: &Path) -> Result<()> {
        load_var_map(self.policy.var_map(), dir.join(MODEL_FILE))?;
        let state = TrainerState::load(dir)?;
        self.iteration = state.iteration;
        self.kl_ctl.set_value(state.kl_coef);
        tracing::info!(
            iteration = state.iteration,
            kl_coef = state.kl_coef,
            "Restored trainer state"
        );
        Ok(())
    }
}

fn scalar_mean(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()? as f64)
}

/// Global L2 norm over every parameter gradient present in `grads`.
fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

fn scale_grads(grads: &mut GradStore, vars: &[Var], scale: f64) -> Result<()> {
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{TinyCausalLm, TinyLmConfig};
    use candle_core::Device;

    fn setup(config: TrainerConfig) -> PpoTrainer<TinyCausalLm, TinyCausalLm> {
        let lm = TinyLmConfig {
            vocab_size: 16,
            hidden_size: 8,
            ..Default::default()
        };
        let policy = TinyCausalLm::new(lm, &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        PpoTrainer::new(policy, reference, config).unwrap()
    }

    fn small_config() -> TrainerConfig {
        TrainerConfig::default()
            .with_batch_size(4, 2)
            .with_lengths(3, 2)
            .with_lr(1e-2)
            .with_ppo_epochs(2)
    }

    fn rollout() -> (Vec<Vec<u32>>, Vec<Vec<u32>>, Vec<f32>) {
        let queries = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10, 11, 12]];
        let responses = vec![vec![2, 3], vec![5, 6], vec![8, 9], vec![11, 12]];
        let scores = vec![1.0, -1.0, 0.5, 2.0];
        (queries, responses, scores)
    }

    #[test]
    fn test_step_reports_stats() {
        let mut trainer = setup(small_config());
        let (q, r, s) = rollout();
        let stats = trainer.step(&q, &r, &s).unwrap();

        for name in [
            "objective/kl",
            "objective/kl_coef",
            "objective/entropy",
            "ppo/mean_non_score_reward",
            "ppo/loss/policy",
            "ppo/loss/value",
            "ppo/loss/total",
            "ppo/policy/approxkl",
            "ppo/policy/clipfrac",
            "ppo/policy/grad_norm",
            "ppo/returns/mean",
            "ppo/val/var_explained",
            "time/ppo/forward_pass",
            "time/ppo/total",
        ] {
            let value = stats.scalar(name).unwrap_or_else(|| panic!("missing {name}"));
            assert!(value.is_finite(), "{name} = {value}");
        }
        assert_eq!(stats.array("objective/kl_dist").unwrap().len(), 4);
        assert_eq!(stats.array("ppo/policy/advantages").unwrap().len(), 8);
        assert_eq!(
            stats.array("ppo/policy/approxkl_per_epoch").unwrap().len(),
            2
        );
        assert_eq!(trainer.iteration(), 1);
    }

    #[test]
    fn test_first_step_has_zero_kl_against_copy() {
        let mut trainer = setup(small_config());
        let (q, r, s) = rollout();
        let stats = trainer.step(&q, &r, &s).unwrap();

        assert!(stats.scalar("objective/kl").unwrap().abs() < 1e-5);
        assert!(stats.scalar("ppo/mean_non_score_reward").unwrap().abs() < 1e-5);
        // zero KL is below target, so beta shrinks
        assert!(trainer.kl_coef() < 0.2);
    }

    #[test]
    fn test_controller_update_uses_snapshot_kl() {
        let mut trainer = setup(small_config());
        let (q, r, s) = rollout();
        trainer.step(&q, &r, &s).unwrap();

        // zero snapshot KL saturates the error at -0.2
        let expected = 0.2 * (1.0 - 0.2 * 4.0 / 10_000.0);
        assert!((trainer.kl_coef() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_fixed_kl_coefficient_is_constant() {
        let mut trainer = setup(small_config().with_fixed_kl(0.1));
        let (q, r, s) = rollout();
        trainer.step(&q, &r, &s).unwrap();
        trainer.step(&q, &r, &s).unwrap();
        assert_eq!(trainer.kl_coef(), 0.1);
    }

    #[test]
    fn test_step_updates_policy_only() {
        let mut trainer = setup(small_config());
        let ids = Tensor::new(&[[1u32, 2, 3, 2, 3]], &Device::Cpu).unwrap();
        let before = trainer.policy().forward(&ids).unwrap().logits;
        let ref_before = trainer.reference().forward(&ids).unwrap().logits;

        let (q, r, s) = rollout();
        trainer.step(&q, &r, &s).unwrap();

        let after = trainer.policy().forward(&ids).unwrap().logits;
        let ref_after = trainer.reference().forward(&ids).unwrap().logits;
        let moved = (after - before)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(moved > 0.0);
        assert_eq!(
            ref_before.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            ref_after.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rejects_wrong_batch() {
        let mut trainer = setup(small_config());
        let (q, r, s) = rollout();
        let err = trainer.step(&q[..3], &r[..3], &s[..3]);
        assert!(matches!(err, Err(TrlError::ShapeMismatch { .. })));

        let mut short = r.clone();
        short[1] = vec![1];
        let err = trainer.step(&q, &short, &s);
        assert!(matches!(err, Err(TrlError::ShapeMismatch { .. })));
        assert_eq!(trainer.iteration(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let lm = TinyLmConfig::default();
        let policy = TinyCausalLm::new(lm, &Device::Cpu).unwrap();
        let reference = policy.frozen_copy().unwrap();
        let config = TrainerConfig::default().with_batch_size(6, 4);
        assert!(matches!(
            PpoTrainer::new(policy, reference, config),
            Err(TrlError::Configuration(_))
        ));
    }

    #[test]
    fn test_grad_clipping_bounds_update() {
        let config = TrainerConfig {
            max_grad_norm: Some(1e-3),
            ..small_config()
        };
        let mut trainer = setup(config);
        let (q, r, s) = rollout();
        let stats = trainer.step(&q, &r, &s).unwrap();
        // reported norm is the pre-clip norm
        assert!(stats.scalar("ppo/policy/grad_norm").unwrap() > 0.0);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = setup(small_config());
        let (q, r, s) = rollout();
        trainer.step(&q, &r, &s).unwrap();
        trainer.save_to(dir.path()).unwrap();

        let mut restored = setup(small_config());
        restored.load_from(dir.path()).unwrap();
        assert_eq!(restored.iteration(), 1);
        assert!((restored.kl_coef() - trainer.kl_coef()).abs() < 1e-12);

        let ids = Tensor::new(&[[1u32, 2, 3, 2, 3]], &Device::Cpu).unwrap();
        let a = trainer.policy().forward(&ids).unwrap().logits;
        let b = restored.policy().forward(&ids).unwrap().logits;
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
