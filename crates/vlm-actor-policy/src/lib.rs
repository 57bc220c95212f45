//! Policy actor over a vision-language backbone
//!
//! Generates a thought + action continuation, re-scores the full sequence in a
//! single forward pass and splits the token log-probabilities into a thought
//! part and an action part, next to a value estimate from the same backbone.

pub mod logprob;
pub mod model;
pub mod span;

pub use crate::logprob::{promote_log_softmax, select_output_log_probs, OutputLogProbs};
pub use crate::model::ValueHead;
pub use crate::span::{locate_action_boundary, split_ranges, template_order, ActionBoundary};

use crate::span::MIN_OUTPUT_TOKENS;
use candle_core::Tensor;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error, warn};
use vlm_actor_core::inputs::id_rows;
use vlm_actor_core::{
    Backbone, CostLedger, CostModel, Error, ForwardOutput, GenerateParams, GenerationConfig,
    IoPair, MarkerConfig, ModelInputs, PrecisionContext, Result, StepInputs, TokenDecoder,
};

/// Combined log-probability reported when the action cannot be localized
pub const SENTINEL_COMBINED_LOG_PROB: f32 = -2.0;
/// Action log-probability reported when the action cannot be localized
pub const SENTINEL_ACTION_LOG_PROB: f32 = -1.0;

/// Value and log-probability decomposition for one step; every tensor is `[batch]`
#[derive(Debug, Clone)]
pub struct ScoredStep {
    pub value: Tensor,
    pub thought_log_prob: Tensor,
    pub action_log_prob: Tensor,
    /// `thought_prob_coef * thought_log_prob + action_log_prob`, or the sentinel
    pub combined_log_prob: Tensor,
    pub boundaries: Vec<ActionBoundary>,
}

/// Byproducts of one generation call together with their scores
#[derive(Debug, Clone)]
pub struct Generation {
    /// Pair and full-sequence inputs, ready to be stored and replayed
    pub step: StepInputs,
    /// Generated text per batch row, special tokens removed
    pub texts: Vec<String>,
    pub scored: ScoredStep,
}

pub struct PolicyActor {
    backbone: Arc<dyn Backbone>,
    tokenizer: Arc<dyn TokenDecoder>,
    value_head: ValueHead,
    ctx: PrecisionContext,
    generation: GenerationConfig,
    markers: MarkerConfig,
    cost: CostModel,
    ledger: Arc<CostLedger>,
}

impl PolicyActor {
    pub fn new(
        backbone: Arc<dyn Backbone>,
        tokenizer: Arc<dyn TokenDecoder>,
        value_head: ValueHead,
        ctx: PrecisionContext,
        generation: GenerationConfig,
        ledger: Arc<CostLedger>,
    ) -> Result<Self> {
        generation.validate()?;
        Ok(Self {
            backbone,
            tokenizer,
            value_head,
            ctx,
            generation,
            markers: MarkerConfig::default(),
            cost: CostModel::default(),
            ledger,
        })
    }

    /// Builder: Set marker templates and fallback policy
    pub fn with_markers(mut self, markers: MarkerConfig) -> Result<Self> {
        markers.validate()?;
        self.markers = markers;
        Ok(self)
    }

    /// Builder: Set cost attribution
    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn markers(&self) -> &MarkerConfig {
        &self.markers
    }

    pub fn context(&self) -> &PrecisionContext {
        &self.ctx
    }

    /// Sample a continuation for `prompt` and score it without gradient tracking
    pub fn generate(&self, prompt: &ModelInputs) -> Result<Generation> {
        let prompt_len = prompt.seq_len()?;
        self.ledger.record_inference(prompt_len);

        let params =
            GenerateParams::new(self.generation.temperature, self.generation.max_new_tokens);
        let generated = self.backbone.generate(prompt, &params)?;
        let sequences = generated.sequences.detach();

        let (_batch, seq_len) = sequences.dims2()?;
        if seq_len < prompt_len {
            return Err(Error::Consistency(format!(
                "backbone returned {} tokens for a {}-token prompt",
                seq_len, prompt_len
            )));
        }
        let new_tokens = seq_len - prompt_len;
        let output_ids = sequences
            .narrow(1, prompt_len, new_tokens)?
            .to_dtype(prompt.input_ids.dtype())?;

        let texts = id_rows(&output_ids)?
            .iter()
            .map(|row| self.tokenizer.decode(row, true))
            .collect::<Result<Vec<_>>>()?;

        let full_ids = Tensor::cat(&[&prompt.input_ids, &output_ids], 1)?;
        if full_ids.dims() != sequences.dims() {
            return Err(Error::Consistency(format!(
                "reassembled sequence {:?} differs from generated {:?}",
                full_ids.dims(),
                sequences.dims()
            )));
        }

        let inputs = prompt.extend_for_output(full_ids, new_tokens)?;
        if inputs.seq_len()? != seq_len {
            return Err(Error::Consistency(format!(
                "full inputs hold {} tokens, expected {}",
                inputs.seq_len()?,
                seq_len
            )));
        }
        debug!(prompt_len, new_tokens, "reassembled generated sequence");

        let step = StepInputs::new(IoPair::new(prompt.input_ids.clone(), output_ids), inputs);
        let scored = self.score(&step, false)?;

        Ok(Generation { step, texts, scored })
    }

    /// Score a generated or replayed step with one forward pass.
    ///
    /// With `training` unset every output is detached from the autograd graph.
    pub fn score(&self, step: &StepInputs, training: bool) -> Result<ScoredStep> {
        let prompt_len = step.io_pair.prompt_len()?;
        let output_len = step.io_pair.output_len()?;
        let full_len = step.inputs.seq_len()?;
        if full_len != prompt_len + output_len {
            return Err(Error::Consistency(format!(
                "full sequence has {} tokens, pair has {} + {}",
                full_len, prompt_len, output_len
            )));
        }
        if !step.io_pair.matches(&step.inputs.input_ids)? {
            return Err(Error::Consistency(
                "full sequence is not the concatenation of prompt and output ids".to_string(),
            ));
        }
        let output_ids = step.inputs.input_ids.narrow(1, prompt_len, output_len)?;

        let forward = self.backbone.forward(&step.inputs)?;
        let forward = if training { forward } else { forward.detach() };

        if training {
            let cost = self.cost.training_cost(full_len, step.inputs.has_modality());
            self.ledger.record_backprop(cost);
        }

        let last_hidden = match check_forward(&forward, prompt_len, output_len) {
            Ok(hidden) => hidden,
            Err(reason) => {
                self.dump_diagnostics(step, &forward, &reason);
                return Err(Error::DegenerateGeneration(reason));
            }
        };

        let hidden = last_hidden
            .narrow(1, prompt_len - 1, 1)?
            .squeeze(1)?
            .to_dtype(self.ctx.dtype)?;
        let value = self.value_head.estimate(&hidden)?;
        let value = if training { value } else { value.detach() };

        let log_probs = promote_log_softmax(
            &forward.logits,
            self.generation.temperature,
            self.ctx.dtype,
        )?;
        let OutputLogProbs { selected, valid } = select_output_log_probs(
            &log_probs,
            &output_ids,
            prompt_len,
            self.markers.pad_token_id,
        )?;
        let steps = output_len - 1;

        let mut thoughts = Vec::with_capacity(valid.len());
        let mut actions = Vec::with_capacity(valid.len());
        let mut combined = Vec::with_capacity(valid.len());
        let mut boundaries = Vec::with_capacity(valid.len());

        for (b, output) in id_rows(&output_ids)?.iter().enumerate() {
            let texts = self.token_texts(output);
            let templates = template_order(output, texts.as_deref(), &self.markers);
            let boundary =
                locate_action_boundary(output, &valid[b], &templates, self.markers.fallback_offset);
            debug!(row = b, ?boundary, "located action boundary");

            let row = selected.get(b)?;
            match boundary.index() {
                Some(index) => {
                    let (thought_range, action_range) = split_ranges(index, steps);
                    let thought = range_sum(&row, thought_range)?;
                    let action = range_sum(&row, action_range)?;
                    let weighted = thought.affine(self.generation.thought_prob_coef, 0.0)?;
                    combined.push(weighted.add(&action)?);
                    thoughts.push(thought);
                    actions.push(action);
                }
                None => {
                    warn!(row = b, output_len, "action span undeterminable, using sentinels");
                    let (dtype, device) = (row.dtype(), row.device());
                    thoughts.push(Tensor::zeros((), dtype, device)?);
                    actions.push(Tensor::new(SENTINEL_ACTION_LOG_PROB, device)?.to_dtype(dtype)?);
                    let sentinel = Tensor::new(SENTINEL_COMBINED_LOG_PROB, device)?;
                    combined.push(sentinel.to_dtype(dtype)?);
                }
            }
            boundaries.push(boundary);
        }

        Ok(ScoredStep {
            value,
            thought_log_prob: Tensor::stack(&thoughts, 0)?,
            action_log_prob: Tensor::stack(&actions, 0)?,
            combined_log_prob: Tensor::stack(&combined, 0)?,
            boundaries,
        })
    }

    /// Training-time scoring of a stored step: `(value, combined_log_prob)` with gradients
    pub fn evaluate_actions(&self, step: &StepInputs) -> Result<(Tensor, Tensor)> {
        let scored = self.score(step, true)?;
        Ok((scored.value, scored.combined_log_prob))
    }

    /// Value estimate from the final-layer hidden state at the last input position
    pub fn value_of(&self, inputs: &ModelInputs) -> Result<Tensor> {
        let seq_len = inputs.seq_len()?;
        if seq_len == 0 {
            return Err(Error::InvalidInput(
                "cannot estimate the value of an empty sequence".to_string(),
            ));
        }
        let forward = self.backbone.forward(inputs)?;
        let last_hidden = forward
            .last_hidden()
            .ok_or_else(|| Error::Backbone("forward returned no hidden states".to_string()))?;
        let hidden = last_hidden
            .narrow(1, seq_len - 1, 1)?
            .squeeze(1)?
            .to_dtype(self.ctx.dtype)?;
        Ok(self.value_head.estimate(&hidden)?)
    }

    /// Decoded text of every output token but the last, one id at a time
    fn token_texts(&self, output: &[u32]) -> Option<Vec<String>> {
        let singles: Vec<Vec<u32>> = output
            .iter()
            .take(output.len().saturating_sub(1))
            .map(|&id| vec![id])
            .collect();
        match self.tokenizer.batch_decode(&singles, true) {
            Ok(texts) => Some(texts),
            Err(e) => {
                warn!("per-token decode failed, using secondary marker first: {}", e);
                None
            }
        }
    }

    fn dump_diagnostics(&self, step: &StepInputs, forward: &ForwardOutput, reason: &str) {
        let decode = |t: &Tensor| -> String {
            match id_rows(t) {
                Ok(rows) => rows
                    .iter()
                    .map(|r| {
                        self.tokenizer
                            .decode(r, false)
                            .unwrap_or_else(|e| format!("<decode failed: {}>", e))
                    })
                    .collect::<Vec<_>>()
                    .join(" | "),
                Err(e) => format!("<unreadable ids: {}>", e),
            }
        };
        let raw = |t: &Tensor| -> String {
            id_rows(t)
                .map(|rows| format!("{:?}", rows))
                .unwrap_or_else(|e| format!("<unreadable ids: {}>", e))
        };

        error!("cannot score generation: {}", reason);
        error!(
            hidden_states = ?forward.last_hidden().map(|h| h.dims().to_vec()),
            logits = ?forward.logits.dims(),
            input_ids = ?step.io_pair.prompt_ids.dims(),
            output_ids = ?step.io_pair.output_ids.dims(),
            full_ids = ?step.inputs.input_ids.dims(),
            "shapes"
        );
        error!("decoded full sequence: {}", decode(&step.inputs.input_ids));
        error!("full sequence ids: {}", raw(&step.inputs.input_ids));
        error!("decoded prompt: {}", decode(&step.io_pair.prompt_ids));
        error!("prompt ids: {}", raw(&step.io_pair.prompt_ids));
    }
}

/// Final-layer hidden states, once the forward output is known to be scoreable
fn check_forward(
    forward: &ForwardOutput,
    prompt_len: usize,
    output_len: usize,
) -> std::result::Result<&Tensor, String> {
    if output_len < MIN_OUTPUT_TOKENS {
        return Err(format!(
            "{} generated tokens, at least {} required",
            output_len, MIN_OUTPUT_TOKENS
        ));
    }
    if prompt_len == 0 {
        return Err("empty prompt".to_string());
    }

    let full_len = prompt_len + output_len;
    let hidden = forward
        .last_hidden()
        .ok_or_else(|| "backbone returned no hidden states".to_string())?;
    match hidden.dims() {
        [_, len, width] if *len == full_len && *width > 0 => {}
        dims => return Err(format!("unexpected hidden-state shape {:?}", dims)),
    }
    match forward.logits.dims() {
        [_, len, vocab] if *len == full_len && *vocab > 0 => {}
        dims => return Err(format!("unexpected logits shape {:?}", dims)),
    }
    Ok(hidden)
}

fn range_sum(row: &Tensor, range: Range<usize>) -> Result<Tensor> {
    if range.is_empty() {
        return Ok(Tensor::zeros((), row.dtype(), row.device())?);
    }
    Ok(row.narrow(0, range.start, range.len())?.sum_all()?)
}
