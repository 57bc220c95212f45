//! VLM policy actor
//!
//! Facade over the core types and the scoring crate. Provides a factory that
//! turns a serde config into a ready actor and a harness that records
//! generations and replays them for the learning phase.

// Re-export core components
pub use vlm_actor_core::*;
pub use vlm_actor_policy::{
    ActionBoundary, Generation, PolicyActor, ScoredStep, ValueHead, SENTINEL_ACTION_LOG_PROB,
    SENTINEL_COMBINED_LOG_PROB,
};

pub mod factory;
pub mod harness;

pub use factory::{ActorConfig, ActorFactory, BuiltActor};
pub use harness::{ReplayedStep, RolloutHarness};
