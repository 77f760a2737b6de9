//! Small causal language model with a value head.

use super::{CausalLm, HasVarMap, LmOutput};
use crate::{Result, TrlError};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

/// Configuration for `TinyCausalLm`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TinyLmConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden layer size
    pub hidden_size: usize,
    /// Number of hidden layers after the context mix
    pub num_layers: usize,
    /// Longest sequence the position table covers
    pub max_position_embeddings: usize,
    /// Activation function
    pub activation: Activation,
}

#[derive(Clone, Debug, Copy, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Tanh,
    Gelu,
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 32,
            num_layers: 1,
            max_position_embeddings: 64,
            activation: Activation::Tanh,
        }
    }
}

/// Token + position embeddings, a causal prefix-average context mix, an MLP
/// trunk, and two heads: next-token logits and a scalar value.
pub struct TinyCausalLm {
    varmap: VarMap,
    wte: Embedding,
    wpe: Embedding,
    mix: Linear,
    trunk: candle_nn::Sequential,
    lm_head: Linear,
    v_head: Linear,
    config: TinyLmConfig,
    device: Device,
}

impl TinyCausalLm {
    /// Create a freshly initialized model
    pub fn new(config: TinyLmConfig, device: &Device) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_size == 0 {
            return Err(TrlError::Configuration(
                "vocab_size and hidden_size must be positive".into(),
            ));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let h = config.hidden_size;

        let wte = candle_nn::embedding(config.vocab_size, h, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(config.max_position_embeddings, h, vb.pp("wpe"))?;
        let mix = candle_nn::linear(h, h, vb.pp("mix"))?;

        let mut trunk = candle_nn::seq();
        for i in 0..config.num_layers {
            trunk = trunk.add(candle_nn::linear(h, h, vb.pp(format!("trunk.{i}")))?);
            match config.activation {
                Activation::ReLU => trunk = trunk.add_fn(|x| x.relu()),
                Activation::Tanh => trunk = trunk.add_fn(|x| x.tanh()),
                Activation::Gelu => trunk = trunk.add_fn(|x| x.gelu()),
            }
        }

        let lm_head = candle_nn::linear(h, config.vocab_size, vb.pp("lm_head"))?;
        let v_head = candle_nn::linear(h, 1, vb.pp("v_head"))?;

        Ok(Self {
            varmap,
            wte,
            wpe,
            mix,
            trunk,
            lm_head,
            v_head,
            config,
            device: device.clone(),
        })
    }

    /// Model configuration
    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    /// Build an independent model with identical parameter values.
    ///
    /// The copy owns its own `VarMap`, so optimizing `self` never moves it;
    /// this is how the frozen reference model is made.
    pub fn frozen_copy(&self) -> Result<Self> {
        let copy = Self::new(self.config.clone(), &self.device)?;
        {
            let src = self
                .varmap
                .data()
                .lock()
                .map_err(|_| TrlError::Training("source var map lock poisoned".into()))?;
            let dst = copy
                .varmap
                .data()
                .lock()
                .map_err(|_| TrlError::Training("target var map lock poisoned".into()))?;
            for (name, var) in src.iter() {
                match dst.get(name) {
                    Some(target) => target.set(&var.as_tensor().copy()?)?,
                    None => {
                        return Err(TrlError::Training(format!(
                            "parameter {name} missing from copy"
                        )))
                    }
                }
            }
        }
        Ok(copy)
    }

    /// Causal prefix-average weights `[seq, seq]`: row `t` averages positions `0..=t`.
    fn prefix_weights(&self, seq_len: usize) -> Result<Tensor> {
        let mask = Tensor::tril2(seq_len, DType::F32, &self.device)?;
        let counts = mask.sum_keepdim(1)?;
        Ok(mask.broadcast_div(&counts)?)
    }
}

impl CausalLm for TinyCausalLm {
    fn forward(&self, input_ids: &Tensor) -> Result<LmOutput> {
        let (b, t) = input_ids.dims2()?;
        if t == 0 || t > self.config.max_position_embeddings {
            return Err(TrlError::shape(
                "TinyCausalLm input length",
                vec![self.config.max_position_embeddings],
                vec![t],
            ));
        }

        let positions = Tensor::arange(0u32, t as u32, &self.device)?;
        let x = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        let weights = self
            .prefix_weights(t)?
            .unsqueeze(0)?
            .broadcast_as((b, t, t))?
            .contiguous()?;
        let context = weights.matmul(&x.contiguous()?)?;

        let hidden = (self.mix.forward(&context)? + &x)?.tanh()?;
        let hidden = self.trunk.forward(&hidden)?;

        let logits = self.lm_head.forward(&hidden)?;
        let values = self.v_head.forward(&hidden)?.squeeze(D::Minus1)?;

        Ok(LmOutput { logits, values })
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}

impl HasVarMap for TinyCausalLm {
    fn var_map(&self) -> &VarMap {
        &self.varmap
    }
}
