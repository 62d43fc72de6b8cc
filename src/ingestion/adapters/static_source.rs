use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use crate::error::{Error, Result};
use crate::ingestion::{fields, FetchOutput, RetryPolicy, SourceAdapter};
use crate::types::{NormalizedRecord, RawRecord, Timestamp};

const EXPECTED_KEYS: [&str; 5] = ["ticker", "price", "market_cap", "volume", "timestamp"];

/// In-process adapter serving whatever records it currently holds.
/// Records use the canonical field names (`ticker`, `price`, `timestamp`, ...).
pub struct StaticAdapter {
    name: String,
    records: Mutex<Vec<RawRecord>>,
    failure: Mutex<Option<String>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl StaticAdapter {
    pub fn new(name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        StaticAdapter {
            name: name.into(),
            records: Mutex::new(records),
            failure: Mutex::new(None),
            delay: None,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Builds records from `(ticker, price, timestamp)` triples.
    pub fn from_quotes<'a, I>(name: impl Into<String>, quotes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64, &'a str)>,
    {
        let records = quotes
            .into_iter()
            .map(|(ticker, price, timestamp)| quote(ticker, price, timestamp))
            .collect();
        Self::new(name, records)
    }

    /// Holds every fetch for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_records(&self, records: Vec<RawRecord>) {
        *self.records.lock() = records;
    }

    /// Makes every following fetch fail with `message` until cleared.
    pub fn fail_with(&self, message: Option<String>) {
        *self.failure.lock() = message;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

/// Canonical raw record for one quote.
pub fn quote(ticker: &str, price: f64, timestamp: &str) -> RawRecord {
    let mut record = RawRecord::new();
    record.insert("ticker".to_string(), Value::from(ticker));
    record.insert("price".to_string(), Value::from(price));
    record.insert("timestamp".to_string(), Value::from(timestamp));
    record
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn expected_keys(&self) -> &[&'static str] {
        &EXPECTED_KEYS
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    async fn fetch(&self) -> Result<FetchOutput> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failure.lock().clone() {
            return Err(Error::Http(message));
        }

        let records = self.records.lock().clone();
        let payload = Value::Array(records.iter().cloned().map(Value::Object).collect());
        Ok(FetchOutput::new(payload, records))
    }

    fn normalize(&self, raw: &RawRecord, fetched_at: Timestamp) -> Result<NormalizedRecord> {
        NormalizedRecord::new(
            fields::ticker(raw, "ticker")?,
            fields::required_number(raw, &["price"], "price")?,
            fields::optional_number(raw, &["market_cap"]),
            fields::optional_number(raw, &["volume"]),
            self.name.as_str(),
            fields::timestamp_or(raw, "timestamp", fetched_at)?,
        )
    }
}
