//! Chunked log-probability / value evaluation over prompt + continuation batches.

use super::ppo::{entropy_from_logits, logprobs_from_logits};
use crate::policy::CausalLm;
use crate::{Result, TrlError};
use candle_core::{Device, Tensor};

/// Per-token outputs restricted to the continuation span, each `[n, L_out]`.
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    pub logprobs: Tensor,
    pub values: Tensor,
    pub entropy: Tensor,
}

/// Frozen evaluation of a rollout batch under the policy and the reference.
#[derive(Clone, Debug)]
pub struct RolloutSnapshot {
    /// Prompt + continuation tokens `[B, L_in + L_out]`
    pub input_ids: Tensor,
    pub logprobs: Tensor,
    pub ref_logprobs: Tensor,
    pub values: Tensor,
    pub entropy: Tensor,
}

impl RolloutSnapshot {
    /// Per-token `logprobs - ref_logprobs`, `[B, L_out]`
    pub fn kl(&self) -> Result<Tensor> {
        Ok((&self.logprobs - &self.ref_logprobs)?)
    }
}

/// Runs models over `[n, L_in + L_out]` token batches in sub-batches of
/// `forward_batch_size`, concatenating results in input order.
#[derive(Clone, Copy, Debug)]
pub struct BatchedForwardEvaluator {
    forward_batch_size: usize,
    query_len: usize,
    response_len: usize,
}

impl BatchedForwardEvaluator {
    /// All three sizes must be positive.
    pub fn new(forward_batch_size: usize, query_len: usize, response_len: usize) -> Result<Self> {
        for (name, value) in [
            ("forward_batch_size", forward_batch_size),
            ("query_len", query_len),
            ("response_len", response_len),
        ] {
            if value == 0 {
                return Err(TrlError::Configuration(format!("{name} must be positive")));
            }
        }
        Ok(Self {
            forward_batch_size,
            query_len,
            response_len,
        })
    }

    pub fn forward_batch_size(&self) -> usize {
        self.forward_batch_size
    }

    /// Concatenate queries and responses into one `u32` id tensor.
    pub fn build_input_ids(
        &self,
        queries: &[Vec<u32>],
        responses: &[Vec<u32>],
        device: &Device,
    ) -> Result<Tensor> {
        if queries.len() != responses.len() {
            return Err(TrlError::shape(
                "responses",
                vec![queries.len()],
                vec![responses.len()],
            ));
        }

        let seq_len = self.query_len + self.response_len;
        let mut flat = Vec::with_capacity(queries.len() * seq_len);
        for (i, (q, r)) in queries.iter().zip(responses).enumerate() {
            if q.len() != self.query_len {
                return Err(TrlError::shape(
                    format!("query {i}"),
                    vec![self.query_len],
                    vec![q.len()],
                ));
            }
            if r.len() != self.response_len {
                return Err(TrlError::shape(
                    format!("response {i}"),
                    vec![self.response_len],
                    vec![r.len()],
                ));
            }
            flat.extend_from_slice(q);
            flat.extend_from_slice(r);
        }

        Ok(Tensor::from_vec(flat, (queries.len(), seq_len), device)?)
    }

    /// Single pass over `input_ids`, keeping the autograd graph.
    pub fn forward(&self, model: &dyn CausalLm, input_ids: &Tensor) -> Result<ForwardOutput> {
        let (n, seq_len) = input_ids.dims2()?;
        let expected = self.query_len + self.response_len;
        if seq_len != expected {
            return Err(TrlError::shape("input_ids", vec![n, expected], vec![n, seq_len]));
        }

        let out = model.forward(input_ids)?;
        let vocab = model.vocab_size();
        if out.logits.dims() != [n, seq_len, vocab] {
            return Err(TrlError::shape(
                "model logits",
                vec![n, seq_len, vocab],
                out.logits.dims(),
            ));
        }
        if out.values.dims() != [n, seq_len] {
            return Err(TrlError::shape(
                "model values",
                vec![n, seq_len],
                out.values.dims(),
            ));
        }

        // logits at position t predict token t + 1
        let start = self.query_len - 1;
        let logits = out.logits.narrow(1, start, self.response_len)?;
        let labels = input_ids.narrow(1, self.query_len, self.response_len)?;

        Ok(ForwardOutput {
            logprobs: logprobs_from_logits(&logits, &labels)?,
            values: out.values.narrow(1, start, self.response_len)?,
            entropy: entropy_from_logits(&logits)?,
        })
    }

    /// Chunked, detached evaluation of the whole batch.
    pub fn evaluate(&self, model: &dyn CausalLm, input_ids: &Tensor) -> Result<ForwardOutput> {
        let n = input_ids.dim(0)?;
        if n % self.forward_batch_size != 0 {
            return Err(TrlError::Configuration(format!(
                "forward_batch_size ({}) must divide batch ({n})",
                self.forward_batch_size
            )));
        }

        let mut logprobs = Vec::with_capacity(n / self.forward_batch_size);
        let mut values = Vec::with_capacity(n / self.forward_batch_size);
        let mut entropy = Vec::with_capacity(n / self.forward_batch_size);

        for start in (0..n).step_by(self.forward_batch_size) {
            let chunk = input_ids.narrow(0, start, self.forward_batch_size)?;
            let out = self.forward(model, &chunk)?;
            logprobs.push(out.logprobs.detach());
            values.push(out.values.detach());
            entropy.push(out.entropy.detach());
        }

        Ok(ForwardOutput {
            logprobs: Tensor::cat(&logprobs, 0)?,
            values: Tensor::cat(&values, 0)?,
            entropy: Tensor::cat(&entropy, 0)?,
        })
    }

    /// Evaluate policy and reference on the same batch.
    pub fn snapshot(
        &self,
        policy: &dyn CausalLm,
        reference: &dyn CausalLm,
        input_ids: &Tensor,
    ) -> Result<RolloutSnapshot> {
        let policy_out = self.evaluate(policy, input_ids)?;
        let ref_out = self.evaluate(reference, input_ids)?;

        tracing::debug!(
            batch = input_ids.dim(0)?,
            chunks = input_ids.dim(0)? / self.forward_batch_size,
            "Evaluated rollout snapshot"
        );

        Ok(RolloutSnapshot {
            input_ids: input_ids.clone(),
            logprobs: policy_out.logprobs,
            ref_logprobs: ref_out.logprobs,
            values: policy_out.values,
            entropy: policy_out.entropy,
        })
    }
}
