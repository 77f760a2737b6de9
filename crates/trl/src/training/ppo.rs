//! PPO losses and diagnostics over per-token tensors.
//!
//! All per-token tensors are `[batch, L_out]`, `f32`.

use crate::Result;
use candle_core::{DType, Tensor, D};
use ndarray::Array1;

/// Log-probability of each label under `logits`.
///
/// `logits` is `[batch, len, vocab]`, `labels` is `[batch, len]` (`u32`).
pub fn logprobs_from_logits(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let logp = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let index = labels.unsqueeze(D::Minus1)?.contiguous()?;
    Ok(logp.gather(&index, D::Minus1)?.squeeze(D::Minus1)?)
}

/// Entropy of the next-token distribution at every position, `[batch, len]`.
pub fn entropy_from_logits(logits: &Tensor) -> Result<Tensor> {
    let logp = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    Ok((logp.exp()? * &logp)?.sum(D::Minus1)?.neg()?)
}

/// Compute PPO clipped policy loss
pub fn ppo_policy_loss(
    advantages: &Tensor,
    logprobs: &Tensor,
    old_logprobs: &Tensor,
    cliprange: f64,
) -> Result<Tensor> {
    let ratio = (logprobs - old_logprobs)?.exp()?;

    let surr1 = (&ratio * advantages)?;
    let surr2 = (ratio.clamp(1.0 - cliprange, 1.0 + cliprange)? * advantages)?;

    Ok(surr1.minimum(&surr2)?.mean_all()?.neg()?)
}

/// Compute clipped value loss
pub fn ppo_value_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    cliprange_value: f64,
) -> Result<Tensor> {
    let values_clipped =
        (old_values + (values - old_values)?.clamp(-cliprange_value, cliprange_value)?)?;

    let loss1 = (values - returns)?.sqr()?;
    let loss2 = (&values_clipped - returns)?.sqr()?;

    Ok((loss1.maximum(&loss2)?.mean_all()? * 0.5)?)
}

/// Approximate KL between snapshot and current policy: `mean(old - curr)`.
pub fn approx_kl(logprobs: &Tensor, old_logprobs: &Tensor) -> Result<f64> {
    Ok((old_logprobs - logprobs)?.mean_all()?.to_scalar::<f32>()? as f64)
}

/// Fraction of importance ratios outside `[1 - eps, 1 + eps]`.
pub fn clip_fraction(ratio: &Tensor, cliprange: f64) -> Result<f64> {
    let above = ratio.gt(1.0 + cliprange)?.to_dtype(DType::F32)?;
    let below = ratio.lt(1.0 - cliprange)?.to_dtype(DType::F32)?;
    Ok((above + below)?.mean_all()?.to_scalar::<f32>()? as f64)
}

/// Fraction of value predictions whose clipped error exceeded the unclipped one.
pub fn value_clip_fraction(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    cliprange_value: f64,
) -> Result<f64> {
    let values_clipped =
        (old_values + (values - old_values)?.clamp(-cliprange_value, cliprange_value)?)?;
    let loss1 = (values - returns)?.sqr()?;
    let loss2 = (&values_clipped - returns)?.sqr()?;
    Ok(loss2
        .gt(&loss1)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()? as f64)
}

/// `1 - Var(returns - pred) / Var(returns)`; 0 when returns are constant.
pub fn explained_variance(pred: &[f32], returns: &[f32]) -> f64 {
    if pred.is_empty() || pred.len() != returns.len() {
        return 0.0;
    }
    let y = Array1::from_iter(returns.iter().map(|v| *v as f64));
    let p = Array1::from_iter(pred.iter().map(|v| *v as f64));
    let var_y = y.var(0.0);
    if var_y == 0.0 {
        return 0.0;
    }
    1.0 - (&y - &p).var(0.0) / var_y
}
