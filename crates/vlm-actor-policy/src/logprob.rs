//! Temperature-corrected token log-probabilities over the generated span

use candle_core::{DType, Tensor, D};
use vlm_actor_core::inputs::id_rows;
use vlm_actor_core::Result;

/// Log-softmax of `logits / temperature`, computed in f32 and stored back in `working`.
///
/// Reduced-precision softmax over a large vocabulary underflows; only the
/// normalisation runs at full precision.
pub fn promote_log_softmax(logits: &Tensor, temperature: f64, working: DType) -> Result<Tensor> {
    let scaled = logits.to_dtype(DType::F32)?.affine(1.0 / temperature, 0.0)?;
    let log_probs = candle_nn::ops::log_softmax(&scaled, D::Minus1)?;
    Ok(log_probs.to_dtype(working)?)
}

/// Per-position log-probabilities of the generated tokens.
///
/// Position `k` holds the log-probability of output token `k + 1`, read from
/// the logits one position earlier; the first output token is not scored.
#[derive(Debug, Clone)]
pub struct OutputLogProbs {
    /// `[batch, output_len - 1]`, zero where the target is padding
    pub selected: Tensor,

    /// `valid[b][k]` is false where output token `k + 1` is padding
    pub valid: Vec<Vec<bool>>,
}

/// Gather the log-probability of every actual next output token.
///
/// `log_probs` covers the full `[batch, prompt_len + output_len, vocab]` sequence;
/// `output_ids` must hold at least two tokens.
pub fn select_output_log_probs(
    log_probs: &Tensor,
    output_ids: &Tensor,
    prompt_len: usize,
    pad_token_id: u32,
) -> Result<OutputLogProbs> {
    let (_batch, output_len) = output_ids.dims2()?;
    let steps = output_len.saturating_sub(1);

    let predicting = log_probs.narrow(1, prompt_len, steps)?.contiguous()?;
    let targets = output_ids.narrow(1, 1, steps)?.to_dtype(DType::U32)?.contiguous()?;

    let gathered = predicting.gather(&targets.unsqueeze(2)?, 2)?.squeeze(2)?;
    let mask = targets.ne(pad_token_id)?;
    let selected = mask.where_cond(&gathered, &gathered.zeros_like()?)?;

    let valid = id_rows(&targets)?
        .into_iter()
        .map(|row| row.into_iter().map(|id| id != pad_token_id).collect())
        .collect();

    Ok(OutputLogProbs { selected, valid })
}
