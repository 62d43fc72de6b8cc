pub mod batch;
pub mod engine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::types::{EntityKey, SourceQuote, Ticker, Timestamp};

pub use batch::{MergeBatch, StagedEntity};
pub use engine::merge;

/// One row per (ticker, timestamp), carrying every source's latest contribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedEntity {
    pub ticker: Ticker,
    pub timestamp: Timestamp,
    /// Arithmetic mean of `value` across all entries in `sources`.
    pub value: f64,
    /// Taken from the most recently merged source, not aggregated.
    pub market_cap: Option<f64>,
    /// Taken from the most recently merged source, not aggregated.
    pub volume: Option<f64>,
    pub last_source: String,
    pub sources: BTreeMap<String, SourceQuote>,
}

impl UnifiedEntity {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            ticker: self.ticker.clone(),
            timestamp: self.timestamp,
        }
    }
}
