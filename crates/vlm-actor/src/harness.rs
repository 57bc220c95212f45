use crate::{ActorConfig, ActorFactory};
use candle_core::Tensor;
use std::sync::Arc;
use vlm_actor_core::{
    Backbone, CostLedger, ModelInputs, Result, StepRecord, TokenDecoder, TrajectoryStore,
};
use vlm_actor_policy::{Generation, PolicyActor};

/// A stored step re-scored with gradients
#[derive(Debug)]
pub struct ReplayedStep {
    pub record: StepRecord,
    pub value: Tensor,
    pub log_prob: Tensor,
}

/// Records generations into a trajectory store and replays them for training-time scoring
pub struct RolloutHarness {
    actor: PolicyActor,
    store: Arc<TrajectoryStore>,
}

impl RolloutHarness {
    /// Bootstrap the harness from config
    pub fn new(
        store_path: impl AsRef<std::path::Path>,
        config: &ActorConfig,
        backbone: Arc<dyn Backbone>,
        tokenizer: Arc<dyn TokenDecoder>,
    ) -> anyhow::Result<Self> {
        // Initialize Store
        let store = Arc::new(TrajectoryStore::open(store_path)?);

        // Hydrate Actor via Factory
        let built = ActorFactory::build(config, backbone, tokenizer, Arc::new(CostLedger::new()))?;

        Ok(Self::with_store(built.actor, store))
    }

    pub fn with_store(actor: PolicyActor, store: Arc<TrajectoryStore>) -> Self {
        Self { actor, store }
    }

    pub fn actor(&self) -> &PolicyActor {
        &self.actor
    }

    pub fn store(&self) -> &Arc<TrajectoryStore> {
        &self.store
    }

    /// Generate for `prompt` and persist the step under `episode_id`
    pub fn act(&self, episode_id: &str, prompt: &ModelInputs) -> Result<Generation> {
        let generation = self.actor.generate(prompt)?;

        let record = StepRecord::from_step(&generation.step)?
            .with_episode(episode_id)
            .with_texts(generation.texts.clone());
        let key = self.store.insert_step(&record)?;
        tracing::debug!("Recorded step {} for episode {}", key, episode_id);

        Ok(generation)
    }

    /// Re-score every stored step of an episode in training mode
    pub fn replay(&self, episode_id: &str) -> Result<Vec<ReplayedStep>> {
        let device = &self.actor.context().device;
        let records = self.store.query_episode(episode_id)?;

        let mut replayed = Vec::with_capacity(records.len());
        for record in records {
            let step = record.to_step(device)?;
            let (value, log_prob) = self.actor.evaluate_actions(&step)?;
            replayed.push(ReplayedStep {
                record,
                value,
                log_prob,
            });
        }

        tracing::info!("Replayed {} steps for episode {}", replayed.len(), episode_id);
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use vlm_actor_core::testing::{ScriptedBackbone, VocabDecoder, TEST_HIDDEN_SIZE};
    use vlm_actor_core::ValueHeadConfig;

    fn harness(output: Vec<u32>) -> RolloutHarness {
        let config = ActorConfig {
            precision: "f32".to_string(),
            value_head: ValueHeadConfig {
                hidden_size: TEST_HIDDEN_SIZE,
                layers: vec![4, 4],
            },
            ..Default::default()
        };
        let built = ActorFactory::build(
            &config,
            Arc::new(ScriptedBackbone::new(vec![output])),
            Arc::new(VocabDecoder::new()),
            Arc::new(CostLedger::new()),
        )
        .unwrap();
        RolloutHarness::with_store(built.actor, Arc::new(TrajectoryStore::memory().unwrap()))
    }

    fn prompt() -> ModelInputs {
        let device = Device::Cpu;
        ModelInputs::new(Tensor::new(&[[1u32, 40, 1288, 5, 6]], &device).unwrap())
            .with_sequence_aligned(
                "attention_mask",
                Tensor::ones((1, 5), DType::U32, &device).unwrap(),
            )
            .with_fixed("pixel_values", Tensor::zeros((1, 3, 2, 2), DType::F32, &device).unwrap())
    }

    #[test]
    fn test_replay_matches_generation_scores() {
        let harness = harness(vec![40, 40, 330, 1335, 794, 50, 60]);

        let first = harness.act("ep-1", &prompt()).unwrap();
        let second = harness.act("ep-1", &prompt()).unwrap();
        harness.act("ep-2", &prompt()).unwrap();

        let replayed = harness.replay("ep-1").unwrap();
        assert_eq!(replayed.len(), 2);

        for (generation, step) in [first, second].iter().zip(&replayed) {
            let expected = generation.scored.combined_log_prob.to_vec1::<f32>().unwrap();
            let got = step.log_prob.to_vec1::<f32>().unwrap();
            assert!((expected[0] - got[0]).abs() < 1e-6);

            let expected = generation.scored.value.to_vec1::<f32>().unwrap();
            let got = step.value.to_vec1::<f32>().unwrap();
            assert!((expected[0] - got[0]).abs() < 1e-6);

            assert_eq!(step.record.texts, generation.texts);
            assert_eq!(step.record.episode_id.as_deref(), Some("ep-1"));
        }

        let ledger = harness.actor().ledger().snapshot();
        assert_eq!(ledger.inference_calls, 3);
        assert_eq!(ledger.backprop_calls, 2);
    }

    #[test]
    fn test_replay_unknown_episode_is_empty() {
        let harness = harness(vec![40, 50, 60]);
        assert!(harness.replay("missing").unwrap().is_empty());
        assert!(harness.store().is_empty());
    }
}
