//! Token and call accounting

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running cost totals, shared by reference between actors.
///
/// Counters only grow; they are advisory telemetry and never affect scoring.
#[derive(Debug, Default)]
pub struct CostLedger {
    tokens: AtomicU64,
    inference_calls: AtomicU64,
    backprop_calls: AtomicU64,
}

/// Point-in-time copy of a [`CostLedger`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub tokens: u64,
    pub inference_calls: u64,
    pub backprop_calls: u64,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge prompt tokens for one generation call
    pub fn record_inference(&self, prompt_tokens: usize) {
        self.tokens.fetch_add(prompt_tokens as u64, Ordering::Relaxed);
        self.inference_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Charge an already-weighted token cost for one gradient-tracked scoring call
    pub fn record_backprop(&self, weighted_tokens: u64) {
        self.tokens.fetch_add(weighted_tokens, Ordering::Relaxed);
        self.backprop_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn inference_calls(&self) -> u64 {
        self.inference_calls.load(Ordering::Relaxed)
    }

    pub fn backprop_calls(&self) -> u64 {
        self.backprop_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            tokens: self.tokens(),
            inference_calls: self.inference_calls(),
            backprop_calls: self.backprop_calls(),
        }
    }
}
