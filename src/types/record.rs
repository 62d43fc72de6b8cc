use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{Error, Result};
use crate::types::ticker::Ticker;
use crate::types::timestamp::{truncate, Timestamp};

/// One record in the upstream's own wire shape (a JSON object, or a CSV row lifted into one).
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Canonical record produced by a source adapter. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub ticker: Ticker,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
    pub source: String,
    pub timestamp: Timestamp,
}

impl NormalizedRecord {
    pub fn new(
        ticker: Ticker,
        price: f64,
        market_cap: Option<f64>,
        volume: Option<f64>,
        source: impl Into<String>,
        timestamp: Timestamp,
    ) -> Result<Self> {
        if !price.is_finite() || price < 0.0 {
            return Err(Error::validation("price", format!("not a valid price: {}", price)));
        }
        Ok(NormalizedRecord {
            ticker,
            price,
            market_cap: market_cap.filter(|v| v.is_finite()),
            volume: volume.filter(|v| v.is_finite()),
            source: source.into(),
            timestamp: truncate(timestamp),
        })
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            ticker: self.ticker.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn quote(&self) -> SourceQuote {
        SourceQuote {
            value: self.price,
            market_cap: self.market_cap,
            volume: self.volume,
        }
    }
}

/// One source's contribution to a unified entity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceQuote {
    pub value: f64,
    pub market_cap: Option<f64>,
    pub volume: Option<f64>,
}

/// Uniqueness key of a unified entity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub ticker: Ticker,
    pub timestamp: Timestamp,
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker, self.timestamp.to_rfc3339())
    }
}
