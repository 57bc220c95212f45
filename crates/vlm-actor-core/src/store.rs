//! Trajectory store - persistent storage for scored interaction steps
//!
//! Steps are written once at generation time and replayed during the
//! learning phase, where they are rebuilt into [`StepInputs`] on the
//! training device.

use crate::inputs::id_rows;
use crate::{AuxInput, Error, IoPair, ModelInputs, Result, StepInputs};
use candle_core::{DType, Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// Flat tensor contents in an element type that holds the source values exactly.
///
/// Half-precision floats widen losslessly into `F32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::U32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense tensor contents tagged with the dtype they were captured in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub dims: Vec<usize>,
    pub dtype: String,
    pub data: TensorData,
}

impl TensorRecord {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let data = match tensor.dtype() {
            DType::U8 => TensorData::U8(flat.to_vec1::<u8>()?),
            DType::U32 => TensorData::U32(flat.to_vec1::<u32>()?),
            DType::I64 => TensorData::I64(flat.to_vec1::<i64>()?),
            DType::F32 => TensorData::F32(flat.to_vec1::<f32>()?),
            DType::BF16 | DType::F16 => {
                TensorData::F32(flat.to_dtype(DType::F32)?.to_vec1::<f32>()?)
            }
            DType::F64 => TensorData::F64(flat.to_vec1::<f64>()?),
        };
        Ok(Self {
            dims: tensor.dims().to_vec(),
            dtype: tensor.dtype().as_str().to_string(),
            data,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let dtype: DType = self
            .dtype
            .parse()
            .map_err(|e: candle_core::DTypeParseError| Error::InvalidInput(e.to_string()))?;
        let expected: usize = self.dims.iter().product();
        if self.data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "stored tensor holds {} values for dims {:?}",
                self.data.len(),
                self.dims
            )));
        }

        let dims = self.dims.clone();
        let t = match &self.data {
            TensorData::U8(v) => Tensor::from_vec(v.clone(), dims, device)?,
            TensorData::U32(v) => Tensor::from_vec(v.clone(), dims, device)?,
            TensorData::I64(v) => Tensor::from_vec(v.clone(), dims, device)?,
            TensorData::F32(v) => Tensor::from_vec(v.clone(), dims, device)?,
            TensorData::F64(v) => Tensor::from_vec(v.clone(), dims, device)?,
        };
        Ok(t.to_dtype(dtype)?)
    }
}

/// Named auxiliary input of a stored step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxRecord {
    pub name: String,
    pub sequence_aligned: bool,
    pub tensor: TensorRecord,
}

/// One interaction step as persisted on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub episode_id: Option<String>,
    pub prompt_ids: Vec<Vec<u32>>,
    pub output_ids: Vec<Vec<u32>>,

    /// Auxiliary inputs already extended to the full sequence
    pub aux: Vec<AuxRecord>,

    /// Decoded human-readable output, one per batch row
    #[serde(default)]
    pub texts: Vec<String>,
}

impl StepRecord {
    /// Capture a step ready for scoring
    pub fn from_step(step: &StepInputs) -> Result<Self> {
        let aux = step
            .inputs
            .aux
            .iter()
            .map(|(name, input)| {
                Ok(AuxRecord {
                    name: name.clone(),
                    sequence_aligned: input.is_sequence_aligned(),
                    tensor: TensorRecord::from_tensor(input.tensor())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            episode_id: None,
            prompt_ids: id_rows(&step.io_pair.prompt_ids)?,
            output_ids: id_rows(&step.io_pair.output_ids)?,
            aux,
            texts: Vec::new(),
        })
    }

    /// Builder: Set episode ID
    pub fn with_episode(mut self, episode_id: impl Into<String>) -> Self {
        self.episode_id = Some(episode_id.into());
        self
    }

    /// Builder: Set decoded texts
    pub fn with_texts(mut self, texts: Vec<String>) -> Self {
        self.texts = texts;
        self
    }

    /// Rebuild the scoring inputs on `device`
    pub fn to_step(&self, device: &Device) -> Result<StepInputs> {
        let prompt_ids = rows_to_tensor(&self.prompt_ids, device)?;
        let output_ids = rows_to_tensor(&self.output_ids, device)?;
        let io_pair = IoPair::new(prompt_ids, output_ids);
        let full_ids = io_pair.concat(device)?;

        let mut aux = BTreeMap::new();
        for record in &self.aux {
            let tensor = record.tensor.to_tensor(device)?;
            let input = if record.sequence_aligned {
                AuxInput::SequenceAligned(tensor)
            } else {
                AuxInput::Fixed(tensor)
            };
            aux.insert(record.name.clone(), input);
        }

        let inputs = ModelInputs {
            input_ids: full_ids,
            aux,
        };
        Ok(StepInputs::new(io_pair, inputs))
    }

    fn key(&self) -> String {
        let ts = self.recorded_at.timestamp_nanos_opt().unwrap_or(0);
        format!("{:019}_{}", ts, self.id)
    }
}

fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map(|r| r.len()).unwrap_or(0);
    if rows.iter().any(|r| r.len() != width) {
        return Err(Error::InvalidInput("stored id rows have unequal lengths".to_string()));
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

/// Store for persisting interaction steps
pub struct TrajectoryStore {
    db: sled::Db,
}

impl TrajectoryStore {
    /// Open or create a store at the specified path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open an in-memory store (for testing)
    pub fn memory() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Ok(Self { db })
    }

    /// Insert a step; returns its time-ordered key
    pub fn insert_step(&self, record: &StepRecord) -> Result<String> {
        let key = record.key();
        let value = bincode::serialize(record)?;

        self.db.insert(key.as_bytes(), value)?;

        if let Some(episode_id) = &record.episode_id {
            let episode_tree = self.db.open_tree(format!("episode:{}", episode_id))?;
            episode_tree.insert(key.as_bytes(), key.as_bytes())?;
        }

        Ok(key)
    }

    /// Fetch a single step by key
    pub fn get(&self, key: &str) -> Result<Option<StepRecord>> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// All steps of an episode in recording order
    pub fn query_episode(&self, episode_id: &str) -> Result<Vec<StepRecord>> {
        let episode_tree = self.db.open_tree(format!("episode:{}", episode_id))?;
        let mut records = Vec::new();

        for item in episode_tree.iter() {
            let (_index_key, main_key) = item?;
            if let Some(data) = self.db.get(&main_key)? {
                records.push(bincode::deserialize(&data)?);
            }
        }

        Ok(records)
    }

    /// Episodes with recorded steps
    pub fn list_episodes(&self) -> Result<Vec<String>> {
        let mut episodes = Vec::new();

        for name in self.db.tree_names() {
            let name_str = String::from_utf8_lossy(&name);
            if let Some(episode_id) = name_str.strip_prefix("episode:") {
                episodes.push(episode_id.to_string());
            }
        }

        Ok(episodes)
    }

    /// Number of steps in the main tree
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step() -> StepInputs {
        let device = Device::Cpu;
        let prompt = Tensor::new(&[[11u32, 12, 13]], &device).unwrap();
        let output = Tensor::new(&[[21u32, 22]], &device).unwrap();
        let pair = IoPair::new(prompt, output);
        let full = pair.concat(&device).unwrap();
        let inputs = ModelInputs::new(full)
            .with_sequence_aligned(
                "attention_mask",
                Tensor::ones((1, 5), DType::I64, &device).unwrap(),
            )
            .with_fixed("pixel_values", Tensor::new(&[[0.25f32, -1.5]], &device).unwrap());
        StepInputs::new(pair, inputs)
    }

    #[test]
    fn test_record_restores_step() {
        let record = StepRecord::from_step(&sample_step()).unwrap();
        let restored = record.to_step(&Device::Cpu).unwrap();

        assert_eq!(id_rows(&restored.inputs.input_ids).unwrap(), vec![vec![11, 12, 13, 21, 22]]);
        let mask = restored.inputs.get("attention_mask").unwrap();
        assert_eq!(mask.dtype(), DType::I64);
        assert_eq!(mask.dims(), &[1, 5]);
        let pixels = restored.inputs.get("pixel_values").unwrap();
        assert_eq!(pixels.to_vec2::<f32>().unwrap(), vec![vec![0.25, -1.5]]);
        assert!(restored.inputs.has_modality());
    }

    #[test]
    fn test_store_insert_and_query_episode() {
        let store = TrajectoryStore::memory().unwrap();

        let first = StepRecord::from_step(&sample_step()).unwrap().with_episode("ep-1");
        let second = StepRecord::from_step(&sample_step()).unwrap().with_episode("ep-1");
        let other = StepRecord::from_step(&sample_step()).unwrap().with_episode("ep-2");

        let key = store.insert_step(&first).unwrap();
        store.insert_step(&second).unwrap();
        store.insert_step(&other).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.query_episode("ep-1").unwrap().len(), 2);
        assert_eq!(store.list_episodes().unwrap().len(), 2);

        let loaded = store.get(&key).unwrap().unwrap();
        assert_eq!(loaded, first);
    }

    #[test]
    fn test_integer_tensors_keep_exact_values() {
        let device = Device::Cpu;
        let big = (1i64 << 24) + 1;

        let ids = Tensor::new(&[[big, 3]], &device).unwrap();
        let record = TensorRecord::from_tensor(&ids).unwrap();
        assert_eq!(record.data, TensorData::I64(vec![big, 3]));
        let restored = record.to_tensor(&device).unwrap();
        assert_eq!(restored.dtype(), DType::I64);
        assert_eq!(restored.to_vec2::<i64>().unwrap(), vec![vec![big, 3]]);

        let positions = Tensor::new(&[[u32::MAX, 16_777_217]], &device).unwrap();
        let restored = TensorRecord::from_tensor(&positions).unwrap().to_tensor(&device).unwrap();
        assert_eq!(restored.to_vec2::<u32>().unwrap(), vec![vec![u32::MAX, 16_777_217]]);

        let precise = Tensor::new(&[0.1f64, 1e-300], &device).unwrap();
        let restored = TensorRecord::from_tensor(&precise).unwrap().to_tensor(&device).unwrap();
        assert_eq!(restored.to_vec1::<f64>().unwrap(), vec![0.1, 1e-300]);
    }

    #[test]
    fn test_integer_aux_survives_store_round_trip() {
        let store = TrajectoryStore::memory().unwrap();
        let device = Device::Cpu;
        let big = (1i64 << 24) + 1;

        let mut step = sample_step();
        let positions = Tensor::new(&[[0i64, 1, 2, 3, big]], &device).unwrap();
        step.inputs = step.inputs.with_sequence_aligned("position_ids", positions);
        let key = store.insert_step(&StepRecord::from_step(&step).unwrap()).unwrap();

        let restored = store.get(&key).unwrap().unwrap().to_step(&device).unwrap();
        let positions = restored.inputs.get("position_ids").unwrap();
        assert_eq!(positions.to_vec2::<i64>().unwrap(), vec![vec![0, 1, 2, 3, big]]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let record = TensorRecord {
            dims: vec![2, 2],
            dtype: "u8".to_string(),
            data: TensorData::U8(vec![1, 2, 3]),
        };
        assert!(matches!(record.to_tensor(&Device::Cpu), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = rows_to_tensor(&[vec![1, 2], vec![3]], &Device::Cpu);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
