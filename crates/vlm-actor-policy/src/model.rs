use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use vlm_actor_core::{PrecisionContext, ValueHeadConfig};

/// Scalar state-value regressor over the backbone's final hidden state.
///
/// Linear -> ReLU -> Linear -> ReLU -> Linear(1). Parameters are named like a
/// sequential stack, linear layers at even indices, so exported checkpoints
/// load without renaming.
pub struct ValueHead {
    layers: Vec<Linear>,
    head: Linear,
}

impl ValueHead {
    pub fn new(vb: VarBuilder, config: &ValueHeadConfig) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.layers.len());
        let mut in_dim = config.hidden_size;
        for (i, &width) in config.layers.iter().enumerate() {
            layers.push(linear(in_dim, width, vb.pp((2 * i).to_string()))?);
            in_dim = width;
        }
        let head = linear(in_dim, 1, vb.pp((2 * config.layers.len()).to_string()))?;

        Ok(Self { layers, head })
    }

    /// Build fresh parameters in `varmap` at the context's device and precision
    pub fn from_varmap(
        varmap: &VarMap,
        ctx: &PrecisionContext,
        config: &ValueHeadConfig,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, ctx.dtype, &ctx.device);
        Self::new(vb.pp("value_head"), config)
    }

    /// `[batch, hidden]` -> `[batch]`
    pub fn estimate(&self, hidden: &Tensor) -> Result<Tensor> {
        self.forward(hidden)?.squeeze(D::Minus1)
    }
}

impl Module for ValueHead {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?;
            h = h.relu()?;
        }
        self.head.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn small_config() -> ValueHeadConfig {
        ValueHeadConfig {
            hidden_size: 8,
            layers: vec![4, 4],
        }
    }

    #[test]
    fn test_value_head_batched_estimate() {
        let varmap = VarMap::new();
        let head =
            ValueHead::from_varmap(&varmap, &PrecisionContext::cpu_f32(), &small_config()).unwrap();

        let hidden = Tensor::randn(0f32, 1f32, (3, 8), &Device::Cpu).unwrap();
        let values = head.estimate(&hidden).unwrap();
        assert_eq!(values.dims(), &[3]);

        let single = head.estimate(&hidden.narrow(0, 1, 1).unwrap()).unwrap();
        let batched = values.to_vec1::<f32>().unwrap();
        assert!((single.to_vec1::<f32>().unwrap()[0] - batched[1]).abs() < 1e-5);
    }

    #[test]
    fn test_value_head_parameter_names() {
        let varmap = VarMap::new();
        ValueHead::from_varmap(&varmap, &PrecisionContext::cpu_f32(), &small_config()).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in ["value_head.0.weight", "value_head.2.bias", "value_head.4.weight"] {
            assert!(data.contains_key(name), "missing {}", name);
        }
        assert_eq!(data["value_head.4.weight"].dims(), &[1, 4]);
    }

    #[test]
    fn test_value_head_keeps_working_precision() {
        let varmap = VarMap::new();
        let ctx = PrecisionContext::new(Device::Cpu, DType::BF16);
        let head = ValueHead::from_varmap(&varmap, &ctx, &small_config()).unwrap();

        let hidden = Tensor::zeros((2, 8), DType::BF16, &Device::Cpu).unwrap();
        let values = head.estimate(&hidden).unwrap();
        assert_eq!(values.dtype(), DType::BF16);
    }
}
