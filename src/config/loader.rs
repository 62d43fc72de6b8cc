use crate::config::{PipelineConfig, ServiceConfig, StoreBackend, StoreConfig};
use crate::controls::FaultInjection;
use crate::error::{Error, Result};
use crate::ingestion::{DriftDetector, SourceConfig};
use crate::pipeline::PipelineContext;
use crate::store::{MemoryStore, SqliteStore, Store};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

pub const ENV_PREFIX: &str = "MARKET_MERGE";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl AppConfig {
    /// `config/default`, then `config/{env}`, then `MARKET_MERGE_*` variables
    /// (`MARKET_MERGE_PIPELINE__CHAOS_MODE=true`).
    pub fn load(env: &str) -> Result<Self> {
        Self::load_from(Path::new("config"), env)
    }

    pub fn load_from(dir: &Path, env: &str) -> Result<Self> {
        let default = dir.join("default");
        let overlay = dir.join(env);

        let config = Config::builder()
            .add_source(File::with_name(&default.to_string_lossy()))
            .add_source(File::with_name(&overlay.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let app: AppConfig = config.try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(Error::ConfigError("source with empty name".to_string()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(Error::ConfigError(format!("duplicate source name `{}`", source.name)));
            }
        }

        let threshold = self.pipeline.drift_similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::ConfigError(format!(
                "drift_similarity_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.pipeline.fetch_timeout_secs == 0 || self.pipeline.commit_timeout_secs == 0 {
            return Err(Error::ConfigError("pipeline timeouts must be positive".to_string()));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.sqlite_path.is_none() {
            return Err(Error::ConfigError("sqlite backend needs store.sqlite_path".to_string()));
        }
        Ok(())
    }

    pub fn open_store(&self) -> Result<Arc<dyn Store>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Sqlite => {
                let path = self
                    .store
                    .sqlite_path
                    .as_ref()
                    .ok_or_else(|| Error::ConfigError("sqlite backend needs store.sqlite_path".to_string()))?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                tracing::info!(path = %path.display(), "Opening SQLite store");
                Ok(Arc::new(SqliteStore::open(path)?))
            }
        }
    }

    pub fn pipeline_context(&self, store: Arc<dyn Store>) -> PipelineContext {
        PipelineContext::new(store)
            .with_faults(FaultInjection::new(self.pipeline.chaos_mode))
            .with_drift(DriftDetector::new(self.pipeline.drift_similarity_threshold))
            .with_timeouts(self.pipeline.fetch_timeout(), self.pipeline.commit_timeout())
    }
}
