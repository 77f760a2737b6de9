//! Language-model policies.
//!
//! The trainer only talks to models through two capabilities:
//! - `CausalLm` - per-token logits and value estimates for a token batch
//! - `HasVarMap` - access to the trainable parameters
//!
//! `TinyCausalLm` is a small implementation used by the CLI demo and tests.
//! `SequenceSampler` turns a policy into continuations.

mod sampler;
mod tiny_lm;

pub use sampler::{MultinomialSampler, SamplerConfig, SequenceSampler};
pub use tiny_lm::{TinyCausalLm, TinyLmConfig};

use crate::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;

/// Output of a causal LM with a value head.
pub struct LmOutput {
    /// Next-token logits `[batch, seq, vocab]`
    pub logits: Tensor,
    /// Value estimate per position `[batch, seq]`
    pub values: Tensor,
}

/// Trait for autoregressive models with a scalar value head.
///
/// Position `t` of the output must depend only on tokens `0..=t`.
pub trait CausalLm {
    /// Forward pass over `input_ids` (`u32`, `[batch, seq]`).
    fn forward(&self, input_ids: &Tensor) -> Result<LmOutput>;

    /// Device the model's parameters live on
    fn device(&self) -> &Device;

    /// Vocabulary size of the logits
    fn vocab_size(&self) -> usize;
}

/// Trait for models whose parameters can be optimized and persisted.
pub trait HasVarMap {
    /// Get reference to the VarMap
    fn var_map(&self) -> &VarMap;

    /// Total number of scalar parameters
    fn num_parameters(&self) -> usize {
        self.var_map()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }
}

impl<M: CausalLm + ?Sized> CausalLm for &M {
    fn forward(&self, input_ids: &Tensor) -> Result<LmOutput> {
        (**self).forward(input_ids)
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }
}
