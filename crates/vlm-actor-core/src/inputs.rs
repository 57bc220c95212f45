//! Model input bundles and the prompt/output record of one interaction

use crate::{Error, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;

/// An auxiliary model input next to the token ids
#[derive(Debug, Clone)]
pub enum AuxInput {
    /// Dimension 1 runs along the token sequence (attention masks, cross-attention masks).
    /// Grows with the generated text.
    SequenceAligned(Tensor),

    /// Fixed prompt context such as pixel values; carried through unchanged
    Fixed(Tensor),
}

impl AuxInput {
    pub fn tensor(&self) -> &Tensor {
        match self {
            AuxInput::SequenceAligned(t) | AuxInput::Fixed(t) => t,
        }
    }

    pub fn is_sequence_aligned(&self) -> bool {
        matches!(self, AuxInput::SequenceAligned(_))
    }
}

/// Token ids plus named auxiliary tensors, as consumed by the backbone
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `[batch, seq_len]` (u32)
    pub input_ids: Tensor,
    pub aux: BTreeMap<String, AuxInput>,
}

impl ModelInputs {
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            aux: BTreeMap::new(),
        }
    }

    /// Builder: attach a sequence-aligned tensor such as an attention mask
    pub fn with_sequence_aligned(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.aux.insert(name.into(), AuxInput::SequenceAligned(tensor));
        self
    }

    /// Builder: attach fixed prompt context such as pixel values
    pub fn with_fixed(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.aux.insert(name.into(), AuxInput::Fixed(tensor));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.aux.get(name).map(AuxInput::tensor)
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.input_ids.dims2()?.0)
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.input_ids.dims2()?.1)
    }

    /// Whether non-text modality input (any fixed tensor) is present
    pub fn has_modality(&self) -> bool {
        self.aux.values().any(|a| !a.is_sequence_aligned())
    }

    /// Replace the ids with `full_ids` and pad every sequence-aligned tensor
    /// with ones for the `new_tokens` generated positions.
    pub fn extend_for_output(&self, full_ids: Tensor, new_tokens: usize) -> Result<Self> {
        let mut aux = BTreeMap::new();
        for (name, input) in &self.aux {
            let extended = match input {
                AuxInput::SequenceAligned(t) if new_tokens > 0 => {
                    let mut dims = t.dims().to_vec();
                    if dims.len() < 2 {
                        return Err(Error::InvalidInput(format!(
                            "sequence-aligned input '{}' has rank {}, expected at least 2",
                            name,
                            dims.len()
                        )));
                    }
                    dims[1] = new_tokens;
                    let ones = Tensor::ones(dims, t.dtype(), t.device())?;
                    AuxInput::SequenceAligned(Tensor::cat(&[t, &ones], 1)?)
                }
                other => other.clone(),
            };
            aux.insert(name.clone(), extended);
        }
        Ok(Self {
            input_ids: full_ids,
            aux,
        })
    }
}

/// Prompt ids and output ids of one interaction
#[derive(Debug, Clone)]
pub struct IoPair {
    /// `[batch, prompt_len]`
    pub prompt_ids: Tensor,
    /// `[batch, output_len]`, prompt excluded
    pub output_ids: Tensor,
}

impl IoPair {
    pub fn new(prompt_ids: Tensor, output_ids: Tensor) -> Self {
        Self {
            prompt_ids,
            output_ids,
        }
    }

    pub fn prompt_len(&self) -> Result<usize> {
        Ok(self.prompt_ids.dims2()?.1)
    }

    pub fn output_len(&self) -> Result<usize> {
        Ok(self.output_ids.dims2()?.1)
    }

    /// Prompt followed by output, on `device`
    pub fn concat(&self, device: &Device) -> Result<Tensor> {
        let prompt = self.prompt_ids.to_device(device)?;
        let output = self.output_ids.to_device(device)?;
        Ok(Tensor::cat(&[&prompt, &output], 1)?)
    }

    /// Whether `full_ids` is exactly this pair's concatenation
    pub fn matches(&self, full_ids: &Tensor) -> Result<bool> {
        let joined = self.concat(full_ids.device())?;
        if joined.dims() != full_ids.dims() {
            return Ok(false);
        }
        Ok(id_rows(&joined)? == id_rows(full_ids)?)
    }
}

/// Everything needed to score one interaction: the pair and the full-sequence inputs
#[derive(Debug, Clone)]
pub struct StepInputs {
    pub io_pair: IoPair,
    pub inputs: ModelInputs,
}

impl StepInputs {
    pub fn new(io_pair: IoPair, inputs: ModelInputs) -> Self {
        Self { io_pair, inputs }
    }
}

/// Rows of a `[batch, len]` id tensor
pub fn id_rows(ids: &Tensor) -> Result<Vec<Vec<u32>>> {
    Ok(ids.to_dtype(DType::U32)?.to_vec2::<u32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(rows: &[&[u32]]) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_extend_pads_only_sequence_aligned_inputs() {
        let prompt = ModelInputs::new(ids(&[&[5, 6, 7]]))
            .with_sequence_aligned(
                "attention_mask",
                Tensor::ones((1, 3), DType::U8, &Device::Cpu).unwrap(),
            )
            .with_fixed(
                "pixel_values",
                Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap(),
            );

        let full = ids(&[&[5, 6, 7, 8, 9]]);
        let extended = prompt.extend_for_output(full, 2).unwrap();

        let mask = extended.get("attention_mask").unwrap();
        assert_eq!(mask.dims(), &[1, 5]);
        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(mask.to_vec2::<u8>().unwrap(), vec![vec![1, 1, 1, 1, 1]]);
        assert_eq!(extended.get("pixel_values").unwrap().dims(), &[1, 3, 4, 4]);
        assert_eq!(extended.seq_len().unwrap(), 5);
        assert!(extended.has_modality());
    }

    #[test]
    fn test_extend_rejects_rank_one_mask() {
        let prompt = ModelInputs::new(ids(&[&[1, 2]]))
            .with_sequence_aligned(
                "attention_mask",
                Tensor::ones(2, DType::U8, &Device::Cpu).unwrap(),
            );
        let result = prompt.extend_for_output(ids(&[&[1, 2, 3]]), 1);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_io_pair_concat_and_match() {
        let pair = IoPair::new(ids(&[&[1, 2, 3]]), ids(&[&[4, 5]]));
        let joined = pair.concat(&Device::Cpu).unwrap();
        assert_eq!(id_rows(&joined).unwrap(), vec![vec![1, 2, 3, 4, 5]]);
        assert!(pair.matches(&joined).unwrap());
        assert!(!pair.matches(&ids(&[&[1, 2, 3, 4, 6]])).unwrap());
        assert!(!pair.matches(&ids(&[&[1, 2, 3, 4]])).unwrap());
    }
}
