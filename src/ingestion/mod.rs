//! Extraction side of the pipeline.
//!
//! Every upstream is a [`SourceAdapter`]: `fetch` pulls raw records in the
//! upstream's own shape, `normalize` turns one of them into a
//! [`NormalizedRecord`]. Adapters are built once at startup from
//! [`SourceConfig`] and held in a static [`SourceRegistry`].

pub mod adapters;
pub mod drift;
pub mod fields;
pub mod registry;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use crate::error::Result;
use crate::types::{NormalizedRecord, RawRecord, Timestamp};

pub use drift::{DriftDetector, DriftReport};
pub use registry::SourceRegistry;
pub use retry::{retry, RetryPolicy};

/// Result of a single fetch: the payload as received plus the records pulled out of it.
#[derive(Clone, Debug)]
pub struct FetchOutput {
    pub payload: Value,
    pub records: Vec<RawRecord>,
    /// Stamped on records that carry no timestamp of their own.
    pub fetched_at: Timestamp,
}

impl FetchOutput {
    pub fn new(payload: Value, records: Vec<RawRecord>) -> Self {
        FetchOutput {
            payload,
            records,
            fetched_at: chrono::Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Value::Array(Vec::new()), Vec::new())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Unique source name; also the checkpoint key.
    fn name(&self) -> &str;

    /// Wire-format keys a record from this upstream is expected to carry.
    fn expected_keys(&self) -> &[&'static str];

    fn retry_policy(&self) -> RetryPolicy;

    /// One attempt. Callers wrap this in [`retry`] with [`Self::retry_policy`].
    async fn fetch(&self) -> Result<FetchOutput>;

    /// Pure. Fails with `Error::Validation` when a required field is missing or malformed.
    fn normalize(&self, raw: &RawRecord, fetched_at: Timestamp) -> Result<NormalizedRecord>;
}

fn enabled_by_default() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Falls back to the adapter's own policy when absent.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    Coingecko {
        #[serde(default = "adapters::coingecko::default_base_url")]
        base_url: String,
        #[serde(default = "adapters::coingecko::default_vs_currency")]
        vs_currency: String,
        #[serde(default)]
        api_key: Option<String>,
    },
    Coinpaprika {
        #[serde(default = "adapters::coinpaprika::default_base_url")]
        base_url: String,
        #[serde(default = "adapters::coinpaprika::default_limit")]
        limit: usize,
    },
    Csv {
        path: PathBuf,
    },
    BinanceFeed {
        #[serde(default = "adapters::binance_feed::default_url")]
        url: String,
        symbols: Vec<String>,
        #[serde(default = "adapters::binance_feed::default_quote_asset")]
        quote_asset: String,
        #[serde(default = "adapters::binance_feed::default_max_messages")]
        max_messages: usize,
        #[serde(default = "adapters::binance_feed::default_window_secs")]
        window_secs: u64,
    },
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Coingecko { .. } => "coingecko",
            SourceKind::Coinpaprika { .. } => "coinpaprika",
            SourceKind::Csv { .. } => "csv",
            SourceKind::BinanceFeed { .. } => "binance_feed",
        }
    }
}
