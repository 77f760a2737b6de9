//! Continuation sampling from a causal LM.

use super::CausalLm;
use crate::utils::seeded_rng;
use crate::{Result, TrlError};
use candle_core::Tensor;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

const SAMPLER_STREAM: u64 = 2;

/// Trait for samplers that extend prompts with generated tokens.
///
/// Implementations must not mutate the policy.
pub trait SequenceSampler {
    /// Generate exactly `out_len` tokens after `prompt`.
    fn sample(
        &mut self,
        policy: &dyn CausalLm,
        prompt: &[u32],
        out_len: usize,
        pad_token_id: u32,
    ) -> Result<Vec<u32>> {
        let mut out = self.sample_batch(policy, &[prompt.to_vec()], out_len, pad_token_id)?;
        out.pop()
            .ok_or_else(|| TrlError::Training("sampler returned no sequences".into()))
    }

    /// Generate `out_len` tokens for each prompt. All prompts share one length.
    fn sample_batch(
        &mut self,
        policy: &dyn CausalLm,
        prompts: &[Vec<u32>],
        out_len: usize,
        pad_token_id: u32,
    ) -> Result<Vec<Vec<u32>>>;
}

/// Configuration for `MultinomialSampler`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Softmax temperature; 0 means greedy decoding
    pub temperature: f64,
    /// Keep only the k most likely tokens (0 disables)
    pub top_k: usize,
    /// Keep the smallest set of tokens whose mass reaches top_p (1.0 disables)
    pub top_p: f64,
    /// Once sampled, the rest of the continuation is padding
    pub eos_token_id: Option<u32>,
    /// Random seed
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            eos_token_id: None,
            seed: 1,
        }
    }
}

/// Temperature / top-k / top-p sampler, one token per step for the whole batch.
pub struct MultinomialSampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl MultinomialSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = seeded_rng(config.seed, SAMPLER_STREAM);
        Self { config, rng }
    }

    /// Reset the random stream to the configured seed
    pub fn reseed(&mut self) {
        self.rng = seeded_rng(self.config.seed, SAMPLER_STREAM);
    }

    fn pick(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(TrlError::Training("empty logits row".into()));
        }
        if logits.iter().any(|l| l.is_nan()) {
            return Err(TrlError::NumericInstability {
                stage: "sampling",
                batch_index: 0,
                detail: "NaN in next-token logits".into(),
            });
        }

        let mut order: Vec<usize> = (0..logits.len()).collect();
        order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));

        if self.config.temperature <= 0.0 {
            return Ok(order[0] as u32);
        }

        if self.config.top_k > 0 {
            order.truncate(self.config.top_k.min(order.len()));
        }

        let inv_t = 1.0 / self.config.temperature;
        let max = logits[order[0]] as f64 * inv_t;
        let mut weights: Vec<f64> = order
            .iter()
            .map(|&i| (logits[i] as f64 * inv_t - max).exp())
            .collect();

        if self.config.top_p < 1.0 {
            let total: f64 = weights.iter().sum();
            let mut cumulative = 0.0;
            let mut keep = weights.len();
            for (j, w) in weights.iter().enumerate() {
                cumulative += w / total;
                if cumulative >= self.config.top_p {
                    keep = j + 1;
                    break;
                }
            }
            weights.truncate(keep);
            order.truncate(keep);
        }

        let dist = WeightedIndex::new(&weights).map_err(|e| TrlError::NumericInstability {
            stage: "sampling",
            batch_index: 0,
            detail: e.to_string(),
        })?;
        Ok(order[dist.sample(&mut self.rng)] as u32)
    }
}

impl SequenceSampler for MultinomialSampler {
    fn sample_batch(
        &mut self,
        policy: &dyn CausalLm,
        prompts: &[Vec<u32>],
        out_len: usize,
        pad_token_id: u32,
    ) -> Result<Vec<Vec<u32>>> {
        let Some(first) = prompts.first() else {
            return Ok(Vec::new());
        };
        let prompt_len = first.len();
        for (i, p) in prompts.iter().enumerate() {
            if p.len() != prompt_len {
                return Err(TrlError::shape(
                    format!("prompt {i}"),
                    vec![prompt_len],
                    vec![p.len()],
                ));
            }
        }

        let mut sequences: Vec<Vec<u32>> = prompts.to_vec();
        let mut finished = vec![false; prompts.len()];

        for _ in 0..out_len {
            if finished.iter().all(|f| *f) {
                for seq in sequences.iter_mut() {
                    seq.push(pad_token_id);
                }
                continue;
            }

            let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
            let cur_len = sequences[0].len();
            let ids = Tensor::from_vec(flat, (sequences.len(), cur_len), policy.device())?;
            let logits = policy
                .forward(&ids)?
                .logits
                .narrow(1, cur_len - 1, 1)?
                .squeeze(1)?
                .to_dtype(candle_core::DType::F32)?;
            let rows = logits.to_vec2::<f32>()?;

            for (i, row) in rows.iter().enumerate() {
                let token = if finished[i] {
                    pad_token_id
                } else {
                    let token = self.pick(row)?;
                    if Some(token) == self.config.eos_token_id {
                        finished[i] = true;
                    }
                    token
                };
                sequences[i].push(token);
            }
        }

        Ok(sequences
            .into_iter()
            .map(|mut seq| seq.split_off(prompt_len))
            .collect())
    }
}
