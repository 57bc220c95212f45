//! Configuration for generation, action-marker detection and cost accounting

use crate::{Error, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Decoding and policy-weighting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Sampling temperature; log-probabilities are rescaled by its inverse
    pub temperature: f64,

    /// Upper bound on sampled tokens per step
    pub max_new_tokens: usize,

    /// Weight of thought-token likelihood relative to action-token likelihood
    pub thought_prob_coef: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_new_tokens: 256,
            thought_prob_coef: 0.5,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(Error::Config(format!(
                "temperature must be positive and finite, got {}",
                self.temperature
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(Error::Config("max_new_tokens must be at least 1".to_string()));
        }
        if !(self.thought_prob_coef.is_finite() && self.thought_prob_coef >= 0.0) {
            return Err(Error::Config(format!(
                "thought_prob_coef must be non-negative and finite, got {}",
                self.thought_prob_coef
            )));
        }
        Ok(())
    }
}

/// Token templates announcing the start of the action field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Chosen when a generated token decodes to `primary_keyword`
    pub primary: [u32; 3],

    /// Generic template, used when the decoded text does not pick another one
    pub secondary: [u32; 3],

    pub primary_keyword: String,

    /// A token decoding to this keyword yields a template from its neighbours
    pub derived_keyword: String,

    /// With no marker present, the boundary is the n-th valid position from the end
    pub fallback_offset: usize,

    pub pad_token_id: u32,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            primary: [330, 1335, 794],
            secondary: [330, 60599, 794],
            primary_keyword: "action".to_string(),
            derived_keyword: "formula".to_string(),
            fallback_offset: 4,
            pad_token_id: 0,
        }
    }
}

impl MarkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fallback_offset == 0 {
            return Err(Error::Config("fallback_offset must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Token-cost attribution for the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Forward + backward cost relative to a forward pass
    pub backward_multiplier: u64,

    /// Tokens charged for the image when a modality tensor is present
    pub visual_token_surcharge: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            backward_multiplier: 6,
            visual_token_surcharge: 1600,
        }
    }
}

impl CostModel {
    pub fn training_cost(&self, seq_len: usize, has_modality: bool) -> u64 {
        let surcharge = if has_modality { self.visual_token_surcharge } else { 0 };
        self.backward_multiplier * (seq_len as u64 + surcharge)
    }
}

/// Shape of the value-regression MLP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueHeadConfig {
    /// Width of the backbone's final hidden state
    pub hidden_size: usize,

    /// Widths of the hidden layers, in order
    pub layers: Vec<usize>,
}

impl Default for ValueHeadConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            layers: vec![1024, 512],
        }
    }
}

/// Device placement and working precision shared by the value head and the actor
#[derive(Debug, Clone)]
pub struct PrecisionContext {
    pub device: Device,

    /// Storage precision; softmax is always computed in f32
    pub dtype: DType,
}

impl PrecisionContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn cpu_f32() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// Parse a precision name as used in configuration files
    pub fn parse_dtype(name: &str) -> Result<DType> {
        match name.to_ascii_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f16" | "float16" | "half" => Ok(DType::F16),
            "f32" | "float32" | "float" => Ok(DType::F32),
            other => Err(Error::Config(format!("unsupported precision: {}", other))),
        }
    }
}
