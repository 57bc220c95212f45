//! Core components for the VLM policy actor
//!
//! Contains the foundational types shared by the scoring crate and the facade:
//! model input bundles, collaborator traits, configuration, cost accounting
//! and the trajectory store.

pub mod backbone;
pub mod config;
pub mod inputs;
pub mod ledger;
pub mod store;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export core types
pub use backbone::{Backbone, ForwardOutput, GenerateParams, GenerationOutput, TokenDecoder};
pub use config::{CostModel, GenerationConfig, MarkerConfig, PrecisionContext, ValueHeadConfig};
pub use inputs::{AuxInput, IoPair, ModelInputs, StepInputs};
pub use ledger::{CostLedger, LedgerSnapshot};
pub use store::{AuxRecord, StepRecord, TensorData, TensorRecord, TrajectoryStore};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for actor operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Backbone error: {0}")]
    Backbone(String),

    /// Sequence reassembly produced something other than prompt + output.
    #[error("Consistency failure: {0}")]
    Consistency(String),

    /// The model produced an output that cannot be scored (too short, bad hidden-state shape).
    #[error("Degenerate generation: {0}")]
    DegenerateGeneration(String),
}
