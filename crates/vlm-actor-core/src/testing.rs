//! Deterministic backbone and decoder doubles for tests
//!
//! `ScriptedBackbone` is causal: the hidden state at position `p` depends only
//! on tokens `0..=p`, and the logits at `p` depend only on the token at `p`.

use crate::inputs::id_rows;
use crate::{
    Backbone, Error, ForwardOutput, GenerateParams, GenerationOutput, ModelInputs, Result,
    TokenDecoder,
};
use candle_core::{Device, Tensor};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const TEST_VOCAB_SIZE: usize = 60_608;
pub const TEST_HIDDEN_SIZE: usize = 8;
const TEST_LAYERS: usize = 2;

/// Backbone that appends a scripted continuation and scores with fixed formulas
pub struct ScriptedBackbone {
    device: Device,
    vocab_size: usize,
    hidden_size: usize,
    continuation: Vec<Vec<u32>>,
    truncate_sequences: bool,
    drop_hidden_states: bool,
    last_params: Mutex<Option<GenerateParams>>,
    forward_calls: AtomicUsize,
}

impl ScriptedBackbone {
    pub fn new(continuation: Vec<Vec<u32>>) -> Self {
        Self {
            device: Device::Cpu,
            vocab_size: TEST_VOCAB_SIZE,
            hidden_size: TEST_HIDDEN_SIZE,
            continuation,
            truncate_sequences: false,
            drop_hidden_states: false,
            last_params: Mutex::new(None),
            forward_calls: AtomicUsize::new(0),
        }
    }

    /// Builder: return sequences shorter than the prompt from `generate`
    pub fn with_truncated_sequences(mut self) -> Self {
        self.truncate_sequences = true;
        self
    }

    /// Builder: return no hidden states from `forward`
    pub fn without_hidden_states(mut self) -> Self {
        self.drop_hidden_states = true;
        self
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<GenerateParams> {
        self.last_params.lock().unwrap().clone()
    }

    fn embedding(&self, token: u32, h: usize) -> f32 {
        ((token as usize * 7 + h * 13) % 17) as f32 / 17.0 - 0.5
    }

    /// Logit the backbone assigns to `next` right after `token`
    pub fn logit(token: u32, next: usize) -> f32 {
        ((token as usize * 31 + next * 17) % 23) as f32 * 0.25 - 2.0
    }

    /// Reference log-probability of `next` following `token` at `temperature`
    pub fn reference_log_prob(token: u32, next: u32, temperature: f64) -> f64 {
        let scaled: Vec<f64> = (0..TEST_VOCAB_SIZE)
            .map(|v| Self::logit(token, v) as f64 / temperature)
            .collect();
        let max = scaled.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let log_sum = scaled.iter().map(|s| (s - max).exp()).sum::<f64>().ln() + max;
        scaled[next as usize] - log_sum
    }
}

impl Backbone for ScriptedBackbone {
    fn generate(&self, inputs: &ModelInputs, params: &GenerateParams) -> Result<GenerationOutput> {
        *self.last_params.lock().unwrap() = Some(params.clone());

        let prompt_rows = id_rows(&inputs.input_ids)?;
        if prompt_rows.len() != self.continuation.len() {
            return Err(Error::Backbone(format!(
                "scripted {} rows, prompt has {}",
                self.continuation.len(),
                prompt_rows.len()
            )));
        }

        let mut rows = Vec::with_capacity(prompt_rows.len());
        for (prompt, cont) in prompt_rows.iter().zip(&self.continuation) {
            let mut row = prompt.clone();
            if self.truncate_sequences {
                row.pop();
            } else {
                row.extend(cont.iter().take(params.max_new_tokens));
            }
            rows.push(row);
        }

        let width = rows[0].len();
        let flat: Vec<u32> = rows.into_iter().flatten().collect();
        let sequences = Tensor::from_vec(flat, (prompt_rows.len(), width), &self.device)?;
        Ok(GenerationOutput::new(sequences))
    }

    fn forward(&self, inputs: &ModelInputs) -> Result<ForwardOutput> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);

        let rows = id_rows(&inputs.input_ids)?;
        let batch = rows.len();
        let seq_len = rows.first().map(|r| r.len()).unwrap_or(0);

        let mut logits = Vec::with_capacity(batch * seq_len * self.vocab_size);
        let mut hidden = Vec::with_capacity(batch * seq_len * self.hidden_size);
        for row in &rows {
            let mut running = vec![0f32; self.hidden_size];
            for (p, &token) in row.iter().enumerate() {
                for v in 0..self.vocab_size {
                    logits.push(Self::logit(token, v));
                }
                for (h, acc) in running.iter_mut().enumerate() {
                    *acc += self.embedding(token, h);
                    hidden.push(*acc / (p + 1) as f32);
                }
            }
        }

        let logits = Tensor::from_vec(logits, (batch, seq_len, self.vocab_size), &self.device)?;
        let last = Tensor::from_vec(hidden, (batch, seq_len, self.hidden_size), &self.device)?;

        let hidden_states = if self.drop_hidden_states {
            Vec::new()
        } else {
            let mut layers = Vec::with_capacity(TEST_LAYERS);
            for layer in 0..TEST_LAYERS - 1 {
                layers.push(last.affine(0.5 * (layer + 1) as f64, 0.0)?);
            }
            layers.push(last);
            layers
        };

        Ok(ForwardOutput {
            logits,
            hidden_states,
        })
    }
}

/// Decoder over a small fixed vocabulary; unknown ids render as `<id>`
pub struct VocabDecoder {
    vocab: HashMap<u32, String>,
    special: HashSet<u32>,
    fail_batch: bool,
}

impl VocabDecoder {
    /// Ids 0 (pad) and 1 (bos) are special; 330, 1335, 60599 and 794
    /// spell the `"action":` and `"formula":` keys.
    pub fn new() -> Self {
        let vocab = [
            (0u32, "<pad>"),
            (1, "<bos>"),
            (330, " \""),
            (1335, "action"),
            (60599, "formula"),
            (794, "\":"),
            (40, "I"),
            (1288, " think"),
        ]
        .into_iter()
        .map(|(id, text)| (id, text.to_string()))
        .collect();

        Self {
            vocab,
            special: [0u32, 1].into_iter().collect(),
            fail_batch: false,
        }
    }

    /// Builder: make `batch_decode` fail
    pub fn with_failing_batch_decode(mut self) -> Self {
        self.fail_batch = true;
        self
    }
}

impl Default for VocabDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenDecoder for VocabDecoder {
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut text = String::new();
        for id in ids {
            if skip_special_tokens && self.special.contains(id) {
                continue;
            }
            match self.vocab.get(id) {
                Some(piece) => text.push_str(piece),
                None => text.push_str(&format!("<{}>", id)),
            }
        }
        Ok(text)
    }

    fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> Result<Vec<String>> {
        if self.fail_batch {
            return Err(Error::Tokenizer("batch decode disabled".to_string()));
        }
        sequences
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }
}
