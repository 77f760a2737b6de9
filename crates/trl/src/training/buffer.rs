//! Rollout batch storage for the optimization epochs.

use super::forward::RolloutSnapshot;
use crate::{Result, TrlError};
use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;

/// Frozen rollout data for one `step`. Every per-token tensor is `[B, L_out]`.
///
/// Advantages and returns are computed once and reused across all epochs.
#[derive(Clone, Debug)]
pub struct RolloutBatch {
    /// Prompt + continuation tokens `[B, L_in + L_out]`
    pub input_ids: Tensor,
    /// Policy log-probabilities at collection time
    pub logprobs: Tensor,
    /// Value estimates at collection time
    pub values: Tensor,
    /// Whitened advantages
    pub advantages: Tensor,
    /// Value targets (unwhitened advantages + values)
    pub returns: Tensor,
}

impl RolloutBatch {
    pub fn new(snapshot: &RolloutSnapshot, advantages: Tensor, returns: Tensor) -> Result<Self> {
        let expected = snapshot.logprobs.dims().to_vec();
        for (name, t) in [("advantages", &advantages), ("returns", &returns)] {
            if t.dims() != expected.as_slice() {
                return Err(TrlError::shape(name, expected.clone(), t.dims()));
            }
        }

        Ok(Self {
            input_ids: snapshot.input_ids.clone(),
            logprobs: snapshot.logprobs.clone(),
            values: snapshot.values.clone(),
            advantages,
            returns,
        })
    }

    /// Number of trajectories
    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get minibatch by trajectory indices
    pub fn minibatch(&self, indices: &[usize]) -> Result<RolloutBatch> {
        let idx: Vec<u32> = indices.iter().map(|i| *i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.input_ids.device())?;

        Ok(RolloutBatch {
            input_ids: self.input_ids.index_select(&idx, 0)?,
            logprobs: self.logprobs.index_select(&idx, 0)?.detach(),
            values: self.values.index_select(&idx, 0)?.detach(),
            advantages: self.advantages.index_select(&idx, 0)?.detach(),
            returns: self.returns.index_select(&idx, 0)?.detach(),
        })
    }
}

/// Shuffle `0..len` and split it into chunks of `minibatch_size`.
pub fn shuffled_minibatch_indices<R: Rng + ?Sized>(
    len: usize,
    minibatch_size: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
        .chunks(minibatch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}
