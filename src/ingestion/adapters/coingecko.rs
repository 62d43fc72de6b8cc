use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use crate::error::Result;
use crate::ingestion::adapters::{get_json, http_client, object_records};
use crate::ingestion::{fields, FetchOutput, RetryPolicy, SourceAdapter};
use crate::types::{NormalizedRecord, RawRecord, Timestamp};

pub const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// `/coins/markets` item keys.
const EXPECTED_KEYS: [&str; 26] = [
    "id",
    "symbol",
    "name",
    "image",
    "current_price",
    "market_cap",
    "market_cap_rank",
    "fully_diluted_valuation",
    "total_volume",
    "high_24h",
    "low_24h",
    "price_change_24h",
    "price_change_percentage_24h",
    "market_cap_change_24h",
    "market_cap_change_percentage_24h",
    "circulating_supply",
    "total_supply",
    "max_supply",
    "ath",
    "ath_change_percentage",
    "ath_date",
    "atl",
    "atl_change_percentage",
    "atl_date",
    "roi",
    "last_updated",
];

pub fn default_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

pub fn default_vs_currency() -> String {
    "usd".to_string()
}

/// Polling adapter over CoinGecko's market list.
pub struct CoinGeckoAdapter {
    name: String,
    base_url: String,
    vs_currency: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    client: Client,
}

impl CoinGeckoAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        vs_currency: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        Ok(CoinGeckoAdapter {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            vs_currency: vs_currency.into(),
            api_key: None,
            retry: RetryPolicy::default(),
            client: http_client(request_timeout)?,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl SourceAdapter for CoinGeckoAdapter {
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
        let url = format!("{}/coins/markets", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .query(&[("vs_currency", self.vs_currency.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let payload = get_json(request, &self.name).await?;
        let records = object_records(&payload, &self.name)?;
        tracing::debug!(source = %self.name, records = records.len(), "Fetched market list");
        Ok(FetchOutput::new(payload, records))
    }

    fn normalize(&self, raw: &RawRecord, fetched_at: Timestamp) -> Result<NormalizedRecord> {
        NormalizedRecord::new(
            fields::ticker(raw, "symbol")?,
            fields::required_number(raw, &["current_price"], "price")?,
            fields::optional_number(raw, &["market_cap"]),
            fields::optional_number(raw, &["total_volume"]),
            self.name.as_str(),
            fields::timestamp_or(raw, "last_updated", fetched_at)?,
        )
    }
}
