pub mod binance_feed;
pub mod coingecko;
pub mod coinpaprika;
pub mod csv_file;
pub mod static_source;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use crate::error::{Error, Result};

pub use binance_feed::BinanceFeedAdapter;
pub use coingecko::CoinGeckoAdapter;
pub use coinpaprika::CoinPaprikaAdapter;
pub use csv_file::CsvFileAdapter;
pub use static_source::StaticAdapter;

const USER_AGENT: &str = concat!("market-merge/", env!("CARGO_PKG_VERSION"));

pub(crate) fn http_client(request_timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(request_timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::ConfigError(format!("HTTP client: {}", e)))
}

/// Sends `request` and decodes a JSON body. 429 maps to `RateLimited`, any
/// other non-success status to `HttpStatus`.
pub(crate) async fn get_json(request: RequestBuilder, source_name: &str) -> Result<Value> {
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited {
            source_name: source_name.to_string(),
        });
    }
    if !status.is_success() {
        return Err(Error::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        });
    }

    Ok(response.json::<Value>().await?)
}

/// Pulls the object elements out of a JSON array payload. Non-object elements are dropped.
pub(crate) fn object_records(payload: &Value, source_name: &str) -> Result<Vec<crate::types::RawRecord>> {
    let items = payload
        .as_array()
        .ok_or_else(|| Error::DeserializationError(format!("{}: expected a JSON array", source_name)))?;

    let records: Vec<_> = items.iter().filter_map(|item| item.as_object().cloned()).collect();
    if records.len() < items.len() {
        tracing::warn!(
            source = %source_name,
            dropped = items.len() - records.len(),
            "Dropped non-object payload items"
        );
    }
    Ok(records)
}
