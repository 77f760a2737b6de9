//! Tokenizers and the vocabulary artifact.

use crate::{Result, TrlError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Trait for text <-> token-id conversion.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;

    /// Id used to fill continuations after end-of-sequence
    fn pad_token_id(&self) -> u32;

    /// Write the vocabulary to `path`
    fn save(&self, path: &Path) -> Result<()>;
}

const PAD: u32 = 0;
const UNK: u32 = 1;

#[derive(Serialize, Deserialize)]
struct VocabFile {
    pad_token_id: u32,
    unk_token_id: u32,
    chars: Vec<char>,
}

/// Character-level tokenizer. Id 0 is padding, id 1 is unknown.
#[derive(Clone, Debug)]
pub struct CharTokenizer {
    chars: Vec<char>,
    index: HashMap<char, u32>,
}

impl CharTokenizer {
    /// Build a vocabulary from every distinct character in `corpus`, sorted.
    pub fn from_corpus<'a>(corpus: impl IntoIterator<Item = &'a str>) -> Self {
        let mut chars: Vec<char> = corpus.into_iter().flat_map(str::chars).collect();
        chars.sort_unstable();
        chars.dedup();
        Self::from_chars(chars)
    }

    fn from_chars(chars: Vec<char>) -> Self {
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32 + 2))
            .collect();
        Self { chars, index }
    }

    /// Load a vocabulary written by [`Tokenizer::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let vocab: VocabFile = serde_json::from_reader(file)?;
        if vocab.pad_token_id != PAD || vocab.unk_token_id != UNK {
            return Err(TrlError::Collaborator(
                format!(
                    "unsupported special ids pad={} unk={}",
                    vocab.pad_token_id, vocab.unk_token_id
                )
                .into(),
            ));
        }
        Ok(Self::from_chars(vocab.chars))
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .chars()
            .map(|c| self.index.get(&c).copied().unwrap_or(UNK))
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut out = String::with_capacity(ids.len());
        for &id in ids {
            match id {
                PAD => {}
                UNK => out.push('\u{fffd}'),
                _ => match self.chars.get(id as usize - 2) {
                    Some(c) => out.push(*c),
                    None => {
                        return Err(TrlError::Collaborator(
                            format!("token id {id} outside vocabulary of {}", self.vocab_size())
                                .into(),
                        ))
                    }
                },
            }
        }
        Ok(out)
    }

    fn vocab_size(&self) -> usize {
        self.chars.len() + 2
    }

    fn pad_token_id(&self) -> u32 {
        PAD
    }

    fn save(&self, path: &Path) -> Result<()> {
        let vocab = VocabFile {
            pad_token_id: PAD,
            unk_token_id: UNK,
            chars: self.chars.clone(),
        };
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &vocab)?;
        Ok(())
    }
}
