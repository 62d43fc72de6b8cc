use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use crate::error::{Error, Result};
use crate::ingestion::{fields, FetchOutput, RetryPolicy, SourceAdapter};
use crate::types::timestamp::parse_timestamp;
use crate::types::{NormalizedRecord, RawRecord, Timestamp};

const EXPECTED_KEYS: [&str; 3] = ["symbol", "price", "date"];

/// File-based adapter over a delimited file with a `symbol,price,date` header.
///
/// A missing file is not a failure: the fetch comes back empty and the run
/// succeeds with nothing to merge.
pub struct CsvFileAdapter {
    name: String,
    path: PathBuf,
    retry: RetryPolicy,
}

impl CsvFileAdapter {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        CsvFileAdapter {
            name: name.into(),
            path: path.into(),
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lifts each row into a record keyed by the lowercased header. Empty cells
/// are left out; a row the reader cannot decode becomes an empty record.
fn parse_rows(bytes: &[u8], source: &str) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_lowercase())
        .collect();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let mut record = RawRecord::new();
        match row {
            Ok(row) => {
                for (header, cell) in headers.iter().zip(row.iter()) {
                    if !cell.is_empty() {
                        record.insert(header.clone(), Value::String(cell.to_string()));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(source = %source, line = line + 2, error = %e, "Unreadable CSV row");
            }
        }
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn expected_keys(&self) -> &[&'static str] {
        &EXPECTED_KEYS
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn fetch(&self) -> Result<FetchOutput> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(source = %self.name, path = %self.path.display(), "CSV file not found");
                return Ok(FetchOutput::empty());
            }
            Err(e) => return Err(Error::IoError(e)),
        };

        let records = parse_rows(&bytes, &self.name)?;
        let payload = Value::Array(records.iter().cloned().map(Value::Object).collect());
        Ok(FetchOutput::new(payload, records))
    }

    fn normalize(&self, raw: &RawRecord, _fetched_at: Timestamp) -> Result<NormalizedRecord> {
        let date = match fields::get_path(raw, &["date"]) {
            Some(Value::String(date)) => parse_timestamp(date)?,
            _ => return Err(Error::missing("timestamp")),
        };

        NormalizedRecord::new(
            fields::ticker(raw, "symbol")?,
            fields::required_number(raw, &["price"], "price")?,
            None,
            None,
            self.name.as_str(),
            date,
        )
    }
}
