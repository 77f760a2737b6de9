//! Per-token reward shaping and Generalized Advantage Estimation.

use crate::{Result, TrlError};
use candle_core::{DType, Tensor};

const WHITEN_EPS: f64 = 1e-8;

/// Shape per-token rewards for a rollout batch.
///
/// The KL penalty `-kl_coef * (logprobs - ref_logprobs)` is applied at every
/// continuation position; the task score is added at the last one.
///
/// Returns `(rewards, non_score_rewards)`, both `[batch, L_out]`.
pub fn compute_rewards(
    scores: &Tensor,
    logprobs: &Tensor,
    ref_logprobs: &Tensor,
    kl_coef: f64,
) -> Result<(Tensor, Tensor)> {
    let (batch, len) = logprobs.dims2()?;
    if scores.dims() != [batch] {
        return Err(TrlError::shape("scores", vec![batch], scores.dims()));
    }
    if ref_logprobs.dims() != logprobs.dims() {
        return Err(TrlError::shape(
            "ref_logprobs",
            logprobs.dims(),
            ref_logprobs.dims(),
        ));
    }

    let non_score = ((logprobs - ref_logprobs)? * -kl_coef)?;

    let last = scores.reshape((batch, 1))?.to_dtype(non_score.dtype())?;
    let score_row = if len == 1 {
        last
    } else {
        let zeros = Tensor::zeros((batch, len - 1), non_score.dtype(), non_score.device())?;
        Tensor::cat(&[&zeros, &last], 1)?
    };

    let rewards = (&non_score + score_row)?;
    Ok((rewards, non_score))
}

/// Compute Generalized Advantage Estimation (GAE) over `[batch, L_out]` tensors.
///
/// The bootstrap after the last continuation token is 0.
///
/// # Returns
/// `(advantages, returns)` where `returns = advantages + values`
pub fn compute_gae(
    rewards: &Tensor,
    values: &Tensor,
    gamma: f64,
    lam: f64,
) -> Result<(Tensor, Tensor)> {
    let (batch, len) = rewards.dims2()?;
    if values.dims() != rewards.dims() {
        return Err(TrlError::shape("values", rewards.dims(), values.dims()));
    }

    let mut last_gae = Tensor::zeros((batch, 1), rewards.dtype(), rewards.device())?;
    let mut reversed = Vec::with_capacity(len);

    for t in (0..len).rev() {
        let next_values = if t == len - 1 {
            Tensor::zeros((batch, 1), values.dtype(), values.device())?
        } else {
            values.narrow(1, t + 1, 1)?
        };
        let r = rewards.narrow(1, t, 1)?;
        let v = values.narrow(1, t, 1)?;

        let delta = ((r + (next_values * gamma)?)? - v)?;
        last_gae = (delta + (last_gae * (gamma * lam))?)?;
        reversed.push(last_gae.clone());
    }

    reversed.reverse();
    let advantages = Tensor::cat(&reversed, 1)?;
    let returns = (&advantages + values)?;
    Ok((advantages, returns))
}

/// Normalize to zero mean and unit variance using population statistics
/// of every element in `x`.
pub fn whiten(x: &Tensor) -> Result<Tensor> {
    let mean = x.mean_all()?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_all()?;
    let std = (var + WHITEN_EPS)?.sqrt()?;
    Ok(centered.broadcast_div(&std)?)
}

/// Advantage estimator for one rollout batch.
#[derive(Clone, Copy, Debug)]
pub struct AdvantageEstimator {
    pub gamma: f64,
    pub lam: f64,
}

impl AdvantageEstimator {
    pub fn new(gamma: f64, lam: f64) -> Self {
        Self { gamma, lam }
    }

    /// Run GAE on shaped rewards and whiten the advantages across the batch.
    ///
    /// Values are treated as constants. Returns `(advantages, returns)`.
    pub fn estimate(&self, rewards: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let values = values.detach();
        let (advantages, returns) = compute_gae(rewards, &values, self.gamma, self.lam)?;
        let advantages = whiten(&advantages)?;

        for (name, t) in [("advantages", &advantages), ("returns", &returns)] {
            let host = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            if let Some(i) = host.iter().position(|v| !v.is_finite()) {
                return Err(TrlError::NumericInstability {
                    stage: "advantages",
                    batch_index: i / t.dim(1)?,
                    detail: format!("non-finite {name} value {}", host[i]),
                });
            }
        }

        Ok((advantages, returns))
    }
}
