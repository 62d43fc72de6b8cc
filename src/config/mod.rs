use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::observability::logging::LogFormat;

pub mod loader;
pub mod pipeline;

pub use loader::AppConfig;
pub use pipeline::PipelineConfig;

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            bind_addr: default_bind_addr(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Required when `backend = "sqlite"`.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}
