//! Reward sources for RLHF.
//!
//! The trainer only sees `RewardModel`: text in, scalar out. `LexiconSentiment`
//! is a word-list classifier whose score plays the role of a positive-class logit.

use crate::Result;
use std::collections::HashSet;

/// Trait for scalar reward sources.
///
/// Implementations must be stateless with respect to the trainer.
pub trait RewardModel {
    /// Score one text
    fn score(&self, text: &str) -> Result<f32>;

    /// Score many texts, one scalar per input in input order.
    fn score_batch(&self, texts: &[String]) -> Result<Vec<f32>> {
        texts.iter().map(|t| self.score(t)).collect()
    }
}

impl<F> RewardModel for F
where
    F: Fn(&str) -> f32,
{
    fn score(&self, text: &str) -> Result<f32> {
        Ok(self(text))
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "wonderful", "love", "loved", "best", "fun",
    "brilliant", "beautiful", "enjoy", "enjoyed", "perfect", "superb", "nice", "happy",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "awful", "terrible", "boring", "worst", "hate", "hated", "poor", "dull", "waste",
    "horrible", "stupid", "ugly", "sad", "mess", "weak",
];

/// Word-list sentiment score: `bias + positive hits - negative hits`.
#[derive(Clone, Debug)]
pub struct LexiconSentiment {
    positive: HashSet<String>,
    negative: HashSet<String>,
    bias: f32,
    batch_size: usize,
}

impl Default for LexiconSentiment {
    fn default() -> Self {
        Self::new(POSITIVE_WORDS.iter().copied(), NEGATIVE_WORDS.iter().copied())
    }
}

impl LexiconSentiment {
    pub fn new<'a>(
        positive: impl IntoIterator<Item = &'a str>,
        negative: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            positive: positive.into_iter().map(str::to_lowercase).collect(),
            negative: negative.into_iter().map(str::to_lowercase).collect(),
            bias: 0.0,
            batch_size: 16,
        }
    }

    /// Constant added to every score
    pub fn with_bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }

    /// Texts scored per chunk in `score_batch`
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn logit(&self, text: &str) -> f32 {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| {
                let w = w.to_lowercase();
                if self.positive.contains(&w) {
                    1.0
                } else if self.negative.contains(&w) {
                    -1.0
                } else {
                    0.0
                }
            })
            .sum::<f32>()
            + self.bias
    }
}

impl RewardModel for LexiconSentiment {
    fn score(&self, text: &str) -> Result<f32> {
        Ok(self.logit(text))
    }

    fn score_batch(&self, texts: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            scores.extend(chunk.iter().map(|t| self.logit(t)));
            tracing::trace!(chunk = chunk.len(), "Scored sentiment chunk");
        }
        Ok(scores)
    }
}
