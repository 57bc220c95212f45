use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use vlm_actor_core::{
    Backbone, CostLedger, CostModel, Error, GenerationConfig, MarkerConfig, PrecisionContext,
    Result, TokenDecoder, ValueHeadConfig,
};
use vlm_actor_policy::{PolicyActor, ValueHead};

/// Everything needed to assemble a [`PolicyActor`] around a backbone
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    pub generation: GenerationConfig,
    pub markers: MarkerConfig,
    pub cost: CostModel,
    pub value_head: ValueHeadConfig,

    /// "cpu", "cuda" or "metal"
    pub device: String,

    /// Working precision of the value head and log-probabilities: "bf16", "f16" or "f32"
    pub precision: String,

    /// Safetensors file with value-head parameters to load after construction
    pub value_head_weights: Option<PathBuf>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            markers: MarkerConfig::default(),
            cost: CostModel::default(),
            value_head: ValueHeadConfig::default(),
            device: "cpu".to_string(),
            precision: "bf16".to_string(),
            value_head_weights: None,
        }
    }
}

/// An actor together with the variables backing its value head
pub struct BuiltActor {
    pub actor: PolicyActor,
    pub vars: VarMap,
}

impl BuiltActor {
    /// Write the value-head parameters as safetensors
    pub fn save_value_head(&self, path: impl AsRef<Path>) -> Result<()> {
        self.vars.save(path)?;
        Ok(())
    }
}

/// Hydrates a static config into a ready actor
pub struct ActorFactory;

impl ActorFactory {
    /// Read an [`ActorConfig`] from a JSON file
    pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<ActorConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading actor config {}: {}", path.display(), e))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn device(name: &str) -> Result<Device> {
        match name {
            "cuda" => Device::new_cuda(0).map_err(|e| Error::Config(format!("CUDA error: {}", e))),
            "metal" => {
                Device::new_metal(0).map_err(|e| Error::Config(format!("Metal error: {}", e)))
            }
            "cpu" => Ok(Device::Cpu),
            other => Err(Error::Config(format!("unknown device: {}", other))),
        }
    }

    pub fn build(
        config: &ActorConfig,
        backbone: Arc<dyn Backbone>,
        tokenizer: Arc<dyn TokenDecoder>,
        ledger: Arc<CostLedger>,
    ) -> Result<BuiltActor> {
        let device = Self::device(&config.device)?;
        let dtype = PrecisionContext::parse_dtype(&config.precision)?;
        let ctx = PrecisionContext::new(device, dtype);

        let mut vars = VarMap::new();
        let value_head = ValueHead::from_varmap(&vars, &ctx, &config.value_head)?;
        if let Some(path) = &config.value_head_weights {
            vars.load(path)?;
            info!("Loaded value head weights from {}", path.display());
        }

        let actor = PolicyActor::new(
            backbone,
            tokenizer,
            value_head,
            ctx,
            config.generation.clone(),
            ledger,
        )?
        .with_markers(config.markers.clone())?
        .with_cost_model(config.cost);

        info!(
            device = %config.device,
            precision = %config.precision,
            temperature = config.generation.temperature,
            "Policy actor built"
        );
        Ok(BuiltActor { actor, vars })
    }
}
