use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use crate::error::{Error, Result};
use crate::ingestion::adapters::{BinanceFeedAdapter, CoinGeckoAdapter, CoinPaprikaAdapter, CsvFileAdapter};
use crate::ingestion::{SourceAdapter, SourceConfig, SourceKind};

/// Adapters by source name, built once at startup.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(Error::ConfigError(format!("duplicate source name `{}`", name)));
        }
        tracing::info!(source = %name, "Registered source");
        self.adapters.insert(name, adapter);
        Ok(())
    }

    /// Builds one adapter per enabled source. Disabled sources are left out.
    pub fn from_config(sources: &[SourceConfig]) -> Result<Self> {
        let mut registry = SourceRegistry::new();
        for source in sources.iter().filter(|s| s.enabled) {
            registry.register(build_adapter(source)?)?;
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

fn build_adapter(source: &SourceConfig) -> Result<Arc<dyn SourceAdapter>> {
    let timeout = Duration::from_secs(source.request_timeout_secs);
    let adapter: Arc<dyn SourceAdapter> = match &source.kind {
        SourceKind::Coingecko { base_url, vs_currency, api_key } => {
            let adapter = CoinGeckoAdapter::new(&source.name, base_url.as_str(), vs_currency.as_str(), timeout)?
                .with_api_key(api_key.clone());
            Arc::new(match source.retry {
                Some(retry) => adapter.with_retry_policy(retry),
                None => adapter,
            })
        }
        SourceKind::Coinpaprika { base_url, limit } => {
            let adapter = CoinPaprikaAdapter::new(&source.name, base_url.as_str(), *limit, timeout)?;
            Arc::new(match source.retry {
                Some(retry) => adapter.with_retry_policy(retry),
                None => adapter,
            })
        }
        SourceKind::Csv { path } => {
            let adapter = CsvFileAdapter::new(&source.name, path.clone());
            Arc::new(match source.retry {
                Some(retry) => adapter.with_retry_policy(retry),
                None => adapter,
            })
        }
        SourceKind::BinanceFeed { url, symbols, quote_asset, max_messages, window_secs } => {
            if symbols.is_empty() {
                return Err(Error::ConfigError(format!("source `{}` has no symbols", source.name)));
            }
            let adapter = BinanceFeedAdapter::new(
                &source.name,
                url,
                symbols,
                quote_asset.as_str(),
                *max_messages,
                Duration::from_secs(*window_secs),
            );
            Arc::new(match source.retry {
                Some(retry) => adapter.with_retry_policy(retry),
                None => adapter,
            })
        }
    };
    Ok(adapter)
}
