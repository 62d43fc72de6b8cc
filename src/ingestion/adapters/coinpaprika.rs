use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use crate::error::Result;
use crate::ingestion::adapters::{get_json, http_client, object_records};
use crate::ingestion::{fields, FetchOutput, RetryPolicy, SourceAdapter};
use crate::types::{NormalizedRecord, RawRecord, Timestamp};

const EXPECTED_KEYS: [&str; 11] = [
    "id",
    "name",
    "symbol",
    "rank",
    "circulating_supply",
    "total_supply",
    "max_supply",
    "beta_value",
    "first_data_at",
    "last_updated",
    "quotes",
];

pub fn default_base_url() -> String {
    "https://api.coinpaprika.com/v1".to_string()
}

pub fn default_limit() -> usize {
    50
}

/// Polling adapter over CoinPaprika's ticker list. Keeps the first `limit`
/// tickers (the list is ranked) and reads prices from the USD quote.
pub struct CoinPaprikaAdapter {
    name: String,
    base_url: String,
    limit: usize,
    retry: RetryPolicy,
    client: Client,
}

impl CoinPaprikaAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        limit: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        Ok(CoinPaprikaAdapter {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limit,
            retry: RetryPolicy::default(),
            client: http_client(request_timeout)?,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl SourceAdapter for CoinPaprikaAdapter {
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
        let url = format!("{}/tickers", self.base_url);
        let payload = get_json(self.client.get(&url), &self.name).await?;

        let mut records = object_records(&payload, &self.name)?;
        records.truncate(self.limit);
        let payload = Value::Array(records.iter().cloned().map(Value::Object).collect());

        tracing::debug!(source = %self.name, records = records.len(), "Fetched tickers");
        Ok(FetchOutput::new(payload, records))
    }

    fn normalize(&self, raw: &RawRecord, fetched_at: Timestamp) -> Result<NormalizedRecord> {
        NormalizedRecord::new(
            fields::ticker(raw, "symbol")?,
            fields::required_number(raw, &["quotes", "USD", "price"], "price")?,
            fields::optional_number(raw, &["quotes", "USD", "market_cap"]),
            fields::optional_number(raw, &["quotes", "USD", "volume_24h"]),
            self.name.as_str(),
            fields::timestamp_or(raw, "last_updated", fetched_at)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ticker(symbol: &str, price: f64) -> Value {
        json!({
            "id": format!("{}-id", symbol.to_lowercase()),
            "symbol": symbol,
            "last_updated": "2025-01-01T12:00:00Z",
            "quotes": { "USD": { "price": price, "market_cap": 1000.0, "volume_24h": 10.0 } }
        })
    }

    #[tokio::test]
    async fn keeps_only_the_top_of_the_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tickers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                ticker("BTC", 97000.0),
                ticker("ETH", 3400.0),
                ticker("SOL", 190.0),
            ])))
            .mount(&server)
            .await;

        let adapter = CoinPaprikaAdapter::new("coinpaprika", server.uri(), 2, Duration::from_secs(5)).unwrap();
        let output = adapter.fetch().await.unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output.payload.as_array().map(Vec::len), Some(2));

        let eth = adapter.normalize(&output.records[1], output.fetched_at).unwrap();
        assert_eq!(eth.ticker.as_str(), "ETH");
        assert_eq!(eth.price, 3400.0);
        assert_eq!(eth.market_cap, Some(1000.0));
        assert_eq!(eth.volume, Some(10.0));
    }

    #[tokio::test]
    async fn server_error_is_transient_and_client_error_is_not() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tickers"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = CoinPaprikaAdapter::new("coinpaprika", server.uri(), 50, Duration::from_secs(5)).unwrap();
        let err = adapter.fetch().await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 503, .. }));
        assert!(err.is_transient());

        let missing = CoinPaprikaAdapter::new("coinpaprika", format!("{}/nope", server.uri()), 50, Duration::from_secs(5))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::HttpStatus { status: 404, .. }));
        assert!(!missing.is_transient());
    }

    #[test]
    fn missing_usd_quote_fails_validation() {
        let adapter = CoinPaprikaAdapter::new("coinpaprika", default_base_url(), 50, Duration::from_secs(5)).unwrap();
        let raw = json!({"symbol": "BTC", "quotes": {}}).as_object().cloned().unwrap();
        assert!(adapter.normalize(&raw, chrono::Utc::now()).unwrap_err().is_validation());
    }
}
