use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use crate::error::{Error, Result};
use crate::ingestion::{fields, FetchOutput, RetryPolicy, SourceAdapter};
use crate::types::timestamp::from_millis;
use crate::types::{NormalizedRecord, RawRecord, Ticker, Timestamp};

/// Trade event keys.
const EXPECTED_KEYS: [&str; 9] = ["e", "E", "s", "t", "p", "q", "T", "m", "M"];

pub fn default_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

pub fn default_quote_asset() -> String {
    "USDT".to_string()
}

pub fn default_max_messages() -> usize {
    100
}

pub fn default_window_secs() -> u64 {
    10
}

/// Feed adapter over the Binance trade stream. A fetch subscribes, collects
/// trades until `max_messages` arrive or the window closes, then disconnects.
pub struct BinanceFeedAdapter {
    name: String,
    stream_url: String,
    quote_asset: String,
    max_messages: usize,
    window: Duration,
    retry: RetryPolicy,
}

impl BinanceFeedAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        symbols: &[String],
        quote_asset: impl Into<String>,
        max_messages: usize,
        window: Duration,
    ) -> Self {
        let quote_asset = quote_asset.into().to_uppercase();
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}{}@trade", s.trim().to_lowercase(), quote_asset.to_lowercase()))
            .collect();

        BinanceFeedAdapter {
            name: name.into(),
            stream_url: format!("{}/stream?streams={}", base_url.trim_end_matches('/'), streams.join("/")),
            quote_asset,
            max_messages,
            window,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// Combined streams wrap each event as `{"stream": .., "data": {..}}`.
    fn trade_from_text(&self, text: &str) -> Option<RawRecord> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(source = %self.name, error = %e, "Skipping non-JSON frame");
                return None;
            }
        };
        let event = match value {
            Value::Object(mut obj) if obj.contains_key("data") => obj.remove("data")?,
            other => other,
        };
        match event {
            Value::Object(obj) if obj.get("e").and_then(Value::as_str) == Some("trade") => Some(obj),
            _ => None,
        }
    }

    fn base_asset<'a>(&self, symbol: &'a str) -> &'a str {
        let quote_len = self.quote_asset.len();
        if symbol.len() > quote_len && symbol.to_uppercase().ends_with(self.quote_asset.as_str()) {
            symbol.get(..symbol.len() - quote_len).unwrap_or(symbol)
        } else {
            symbol
        }
    }
}

#[async_trait]
impl SourceAdapter for BinanceFeedAdapter {
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
        let (mut stream, _) = connect_async(self.stream_url.as_str())
            .await
            .map_err(|e| Error::FeedConnection(format!("WebSocket connection failed: {}", e)))?;
        tracing::info!(source = %self.name, url = %self.stream_url, "Connected to trade stream");

        let deadline = Instant::now() + self.window;
        let mut records = Vec::new();
        let mut closed = false;

        while records.len() < self.max_messages {
            match timeout_at(deadline, stream.next()).await {
                Err(_) => break,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Ok(Some(Err(e))) => return Err(Error::FeedConnection(e.to_string())),
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Some(trade) = self.trade_from_text(&text) {
                        records.push(trade);
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    closed = true;
                    break;
                }
                Ok(Some(Ok(_))) => {}
            }
        }

        if closed && records.is_empty() {
            return Err(Error::ConnectionClosed);
        }
        if !closed {
            if let Err(e) = stream.close(None).await {
                tracing::debug!(source = %self.name, error = %e, "Close handshake failed");
            }
        }

        tracing::debug!(source = %self.name, records = records.len(), "Collected trades");
        let payload = Value::Array(records.iter().cloned().map(Value::Object).collect());
        Ok(FetchOutput::new(payload, records))
    }

    fn normalize(&self, raw: &RawRecord, _fetched_at: Timestamp) -> Result<NormalizedRecord> {
        let symbol = match fields::get_path(raw, &["s"]) {
            Some(Value::String(s)) => s.as_str(),
            _ => return Err(Error::missing("ticker")),
        };
        let trade_time = fields::get_path(raw, &["T"])
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::missing("timestamp"))?;

        NormalizedRecord::new(
            Ticker::parse(self.base_asset(symbol))?,
            fields::required_number(raw, &["p"], "price")?,
            None,
            fields::optional_number(raw, &["q"]),
            self.name.as_str(),
            from_millis(trade_time)?,
        )
    }
}
