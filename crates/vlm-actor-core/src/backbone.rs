//! Collaborator interfaces: the transformer backbone and the tokenizer

use crate::{ModelInputs, Result};
use candle_core::Tensor;

/// Decoding parameters handed to [`Backbone::generate`]
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub temperature: f64,
    pub max_new_tokens: usize,
    /// Request per-step scores alongside the sampled ids
    pub output_scores: bool,
    /// Request per-step hidden states alongside the sampled ids
    pub output_hidden_states: bool,
}

impl GenerateParams {
    pub fn new(temperature: f64, max_new_tokens: usize) -> Self {
        Self {
            temperature,
            max_new_tokens,
            output_scores: true,
            output_hidden_states: true,
        }
    }
}

/// Result of autoregressive generation
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt followed by sampled ids, `[batch, prompt_len + new_tokens]` (u32)
    pub sequences: Tensor,

    /// Per-step logits, present when requested
    pub scores: Vec<Tensor>,

    /// Per-step final-layer hidden states, present when requested
    pub hidden_states: Vec<Tensor>,
}

impl GenerationOutput {
    pub fn new(sequences: Tensor) -> Self {
        Self {
            sequences,
            scores: Vec::new(),
            hidden_states: Vec::new(),
        }
    }
}

/// Result of one forward pass over a full sequence
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[batch, seq_len, vocab]`
    pub logits: Tensor,

    /// One `[batch, seq_len, hidden]` tensor per layer, final layer last
    pub hidden_states: Vec<Tensor>,
}

impl ForwardOutput {
    /// Final-layer hidden states, if the backbone returned any
    pub fn last_hidden(&self) -> Option<&Tensor> {
        self.hidden_states.last()
    }

    /// Cut every tensor out of the autograd graph
    pub fn detach(self) -> Self {
        Self {
            logits: self.logits.detach(),
            hidden_states: self.hidden_states.iter().map(|h| h.detach()).collect(),
        }
    }
}

/// Vision-language transformer used both for sampling and for re-scoring
pub trait Backbone: Send + Sync {
    /// Sample a continuation for `inputs`
    fn generate(&self, inputs: &ModelInputs, params: &GenerateParams) -> Result<GenerationOutput>;

    /// Score a full sequence, returning logits and per-layer hidden states
    fn forward(&self, inputs: &ModelInputs) -> Result<ForwardOutput>;
}

/// Token id to text conversion
pub trait TokenDecoder: Send + Sync {
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> Result<Vec<String>> {
        sequences
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }
}

#[cfg(feature = "hf-tokenizers")]
impl TokenDecoder for tokenizers::Tokenizer {
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        tokenizers::Tokenizer::decode(self, ids, skip_special_tokens)
            .map_err(|e| crate::Error::Tokenizer(e.to_string()))
    }

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> Result<Vec<String>> {
        let borrowed: Vec<&[u32]> = sequences.iter().map(|s| s.as_slice()).collect();
        self.decode_batch(&borrowed, skip_special_tokens)
            .map_err(|e| crate::Error::Tokenizer(e.to_string()))
    }
}

#[cfg(all(test, feature = "hf-tokenizers"))]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[PAD]": 0, "hello": 1, "world": 2, "[UNK]": 3},
            "unk_token": "[UNK]"
        }
    }"#;

    fn tokenizer() -> tokenizers::Tokenizer {
        tokenizers::Tokenizer::from_str(WORD_LEVEL).unwrap()
    }

    #[test]
    fn test_word_level_decode_skips_special_tokens() {
        let tokenizer = tokenizer();
        let decoder: &dyn TokenDecoder = &tokenizer;

        assert_eq!(decoder.decode(&[1, 2, 0], true).unwrap(), "hello world");
        assert_eq!(decoder.decode(&[0, 1], false).unwrap(), "[PAD] hello");
    }

    #[test]
    fn test_word_level_batch_decode_per_sequence() {
        let tokenizer = tokenizer();
        let decoder: &dyn TokenDecoder = &tokenizer;

        let texts = decoder.batch_decode(&[vec![1], vec![2], vec![0]], true).unwrap();
        assert_eq!(texts, vec!["hello", "world", ""]);
    }
}
